//! Tests for the chunked compositor: paste geometry, coverage and output files.

use wsi_tiler::grid::{ChunkGrid, ChunkSize};
use wsi_tiler::pipeline::{ChunkedCompositor, CompositeConfig, PastePlan};
use wsi_tiler::slide::TiffSlideOpener;
use wsi_tiler::{ImageEncoder, OutputFormat};

use super::test_utils::{write_slide, PatternOpener, PatternSlide, GLASS};

fn compositor(target: (u32, u32), chunk: u32) -> ChunkedCompositor {
    ChunkedCompositor::new(CompositeConfig {
        target,
        chunk_size: ChunkSize::square(chunk),
        ..CompositeConfig::default()
    })
}

#[test]
fn test_paste_offsets_follow_grid_indices() {
    let slide = (2000, 1500);
    let chunk = ChunkSize::square(512);
    let target = (400, 300);
    let grid = ChunkGrid::partition(slide.0, slide.1, chunk).unwrap();

    // nominal = floor(512 / 2000 * 400) = 102, floor(512 / 1500 * 300) = 102
    for cell in grid.cells() {
        let actual = (cell.rect.width, cell.rect.height);
        let plan = PastePlan::for_cell(&cell, actual, slide, chunk, target).unwrap();
        assert_eq!(plan.paste_x, cell.col * 102);
        assert_eq!(plan.paste_y, cell.row * 102);
    }

    // The truncated last column (464 wide) keeps its grid offset
    let last = grid.cell(3, 2).unwrap();
    let plan = PastePlan::for_cell(&last, (464, 476), slide, chunk, target).unwrap();
    assert_eq!((plan.paste_x, plan.paste_y), (306, 204));
    assert_eq!((plan.scaled_width, plan.scaled_height), (92, 95));
}

#[tokio::test]
async fn test_full_coverage_at_identity_scale() {
    for (width, height, chunk) in [(1000, 1000, 512), (1024, 1024, 256), (2048, 512, 512)] {
        let slide = PatternSlide::uniform(width, height, GLASS);
        let composite = compositor((width, height), chunk)
            .compose(&slide)
            .await
            .unwrap();

        assert_eq!(composite.report.failed, 0);
        assert_eq!(composite.report.skipped_degenerate, 0);
        assert!(
            composite.canvas.pixels().all(|p| p.0 != [0, 0, 0]),
            "background left in {}x{} / {}",
            width,
            height,
            chunk
        );
    }
}

#[tokio::test]
async fn test_failed_chunk_leaves_background() {
    let slide = PatternSlide::uniform(1000, 1000, GLASS).failing_at(0, 512);
    let composite = compositor((500, 500), 512).compose(&slide).await.unwrap();

    assert_eq!(composite.report.chunks, 4);
    assert_eq!(composite.report.failed, 1);
    assert_eq!(composite.report.pasted, 3);

    // Chunk (0, 1) would cover [0, 256) x [256, 500)
    assert_eq!(composite.canvas.get_pixel(100, 400).0, [0, 0, 0]);
    assert_ne!(composite.canvas.get_pixel(400, 400).0, [0, 0, 0]);
    assert_ne!(composite.canvas.get_pixel(100, 100).0, [0, 0, 0]);
}

#[tokio::test]
async fn test_compose_file_writes_stem_named_output() {
    let dir = tempfile::tempdir().unwrap();
    let slide_path = dir.path().join("in").join("S-042.tiff");
    write_slide(&slide_path, 640, 480, 64, |x, y| {
        [(x % 256) as u8, (y % 256) as u8, 128]
    });

    let out = dir.path().join("composites");
    let compositor = ChunkedCompositor::new(CompositeConfig {
        target: (320, 240),
        chunk_size: ChunkSize::square(200),
        encoder: ImageEncoder::jpeg(90),
        ..CompositeConfig::default()
    });
    let report = compositor
        .compose_file(&TiffSlideOpener::new(), &slide_path, &out)
        .await
        .unwrap();

    let expected = out.join("S-042.jpg");
    assert_eq!(report.output.as_deref(), Some(expected.as_path()));
    assert_eq!(report.chunks, 12);
    assert_eq!(report.pasted, 12);

    let written = image::open(&expected).unwrap();
    assert_eq!((written.width(), written.height()), (320, 240));
    assert_eq!(compositor.config().encoder.format, OutputFormat::Jpeg);
}

#[tokio::test]
async fn test_compose_file_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = compositor((100, 100), 64)
        .compose_file(&PatternOpener::new(), &dir.path().join("nope.svs"), dir.path())
        .await;

    assert!(matches!(result, Err(wsi_tiler::TilingError::Slide(_))));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}
