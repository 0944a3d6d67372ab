//! Batch driver tests over real folders of synthetic TIFF slides.

use std::sync::Arc;
use std::time::Duration;

use wsi_tiler::batch::{BatchConfig, BatchDriver, DiscoveryMode};
use wsi_tiler::error::BatchError;
use wsi_tiler::grid::ChunkSize;
use wsi_tiler::pipeline::{CompositeConfig, ExtractConfig};
use wsi_tiler::shutdown::ShutdownSignal;
use wsi_tiler::slide::TiffSlideOpener;

use super::test_utils::{
    file_names, tissue_left_of, write_slide, DecodeGauge, PatternOpener, PatternSlide, TISSUE,
};

fn extract_config(workers: usize) -> ExtractConfig {
    ExtractConfig {
        chunk_size: ChunkSize::square(64),
        min_patch_size: 64,
        workers,
        ..ExtractConfig::default()
    }
}

fn batch(input: &std::path::Path, output: &std::path::Path, discovery: DiscoveryMode) -> BatchConfig {
    BatchConfig {
        discovery,
        extensions: vec!["svs".to_string(), "tif".to_string()],
        ..BatchConfig::new(input, output)
    }
}

#[tokio::test]
async fn test_per_folder_extraction_isolates_bad_slides() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slides");
    let output = dir.path().join("patches");

    write_slide(&input.join("case-a").join("scan.svs"), 128, 128, 32, tissue_left_of(64));
    write_slide(&input.join("case-b").join("scan.SVS"), 192, 64, 32, tissue_left_of(192));
    std::fs::create_dir_all(input.join("case-c")).unwrap();
    std::fs::write(input.join("case-c").join("broken.svs"), b"definitely not a tiff").unwrap();

    let mut config = batch(&input, &output, DiscoveryMode::PerFolder);
    config.slide_jobs = 2;
    config.report = Some(dir.path().join("report.json"));

    let report = BatchDriver::new(config)
        .run_extraction(Arc::new(TiffSlideOpener::new()), extract_config(4))
        .await
        .unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);

    let names: Vec<&str> = report.slides.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["case-a", "case-b", "case-c"]);
    assert!(report.slides[2].error.is_some());

    assert_eq!(
        file_names(&output.join("case-a")),
        vec!["0_0.png", "0_64.png"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(file_names(&output.join("case-b")).len(), 3);
    assert!(!output.join("case-c").exists());

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("report.json")).unwrap()).unwrap();
    assert_eq!(json["succeeded"], 2);
    assert_eq!(json["slides"][0]["report"]["saved"], 2);
}

#[tokio::test]
async fn test_flat_composite_batch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slides");
    let output = dir.path().join("thumbs");

    write_slide(&input.join("first.svs"), 256, 128, 64, tissue_left_of(128));
    write_slide(&input.join("second.tif"), 100, 100, 32, tissue_left_of(50));
    write_slide(&input.join("nested").join("ignored.svs"), 64, 64, 32, tissue_left_of(32));
    std::fs::write(input.join("readme.txt"), b"notes").unwrap();

    let composite = CompositeConfig {
        target: (64, 32),
        chunk_size: ChunkSize::square(64),
        ..CompositeConfig::default()
    };
    let report = BatchDriver::new(batch(&input, &output, DiscoveryMode::Flat))
        .run_composite(Arc::new(TiffSlideOpener::new()), composite)
        .await
        .unwrap();

    assert_eq!(report.discovered, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(
        file_names(&output),
        vec!["first.png".to_string(), "second.png".to_string()]
    );

    let thumb = image::open(output.join("first.png")).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (64, 32));
}

#[tokio::test]
async fn test_recursive_composite_batch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slides");
    let output = dir.path().join("thumbs");

    write_slide(&input.join("a").join("b").join("deep.svs"), 64, 64, 32, tissue_left_of(32));
    write_slide(&input.join("top.svs"), 64, 64, 32, tissue_left_of(32));

    let composite = CompositeConfig {
        target: (16, 16),
        chunk_size: ChunkSize::square(32),
        ..CompositeConfig::default()
    };
    let report = BatchDriver::new(batch(&input, &output, DiscoveryMode::Recursive))
        .run_composite(Arc::new(TiffSlideOpener::new()), composite)
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(
        file_names(&output),
        vec!["deep.png".to_string(), "top.png".to_string()]
    );
}

#[tokio::test]
async fn test_empty_input_returns_empty_report() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty");
    std::fs::create_dir_all(&input).unwrap();
    let output = dir.path().join("out");

    let report = BatchDriver::new(batch(&input, &output, DiscoveryMode::Flat))
        .run_extraction(Arc::new(TiffSlideOpener::new()), extract_config(2))
        .await
        .unwrap();

    assert!(report.is_empty());
    assert!(report.slides.is_empty());
    assert!(output.is_dir());
}

#[tokio::test]
async fn test_missing_input_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = BatchDriver::new(batch(
        &dir.path().join("missing"),
        &dir.path().join("out"),
        DiscoveryMode::Flat,
    ))
    .run_composite(Arc::new(TiffSlideOpener::new()), CompositeConfig::default())
    .await;

    assert!(matches!(result, Err(BatchError::InputNotFound(_))));
}

#[tokio::test]
async fn test_shutdown_skips_remaining_slides() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slides");
    write_slide(&input.join("one.svs"), 64, 64, 32, tissue_left_of(64));
    write_slide(&input.join("two.svs"), 64, 64, 32, tissue_left_of(64));

    let shutdown = ShutdownSignal::new();
    shutdown.trigger();

    let report = BatchDriver::new(batch(&input, &dir.path().join("out"), DiscoveryMode::Flat))
        .with_shutdown(shutdown)
        .run_extraction(Arc::new(TiffSlideOpener::new()), extract_config(2))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.discovered, 2);
    assert!(report.slides.is_empty());
}

#[tokio::test]
async fn test_slide_jobs_never_exceed_worker_budget() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slides");
    std::fs::create_dir_all(&input).unwrap();

    let gauge = DecodeGauge::new();
    let mut opener = PatternOpener::new();
    for name in ["a.svs", "b.svs", "c.svs", "d.svs"] {
        let path = input.join(name);
        std::fs::write(&path, b"").unwrap();
        let slide = PatternSlide::uniform(128, 128, TISSUE)
            .slow(Arc::clone(&gauge), Duration::from_millis(20));
        opener = opener.with_slide(path, slide);
    }

    let mut config = batch(&input, &dir.path().join("out"), DiscoveryMode::Flat);
    config.slide_jobs = 4;

    let report = BatchDriver::new(config)
        .run_extraction(Arc::new(opener), extract_config(2))
        .await
        .unwrap();

    assert_eq!(report.succeeded, 4);
    assert_eq!(report.slides[0].report.as_ref().unwrap().saved, 4);
    assert!(gauge.peak() >= 1);
    assert!(gauge.peak() <= 2, "{} decodes overlapped", gauge.peak());
}
