//! Tissue patch extraction.
//!
//! Every chunk of a slide becomes one independent task:
//!
//! ```text
//! Pending ──► Decoding ──┬──► SizeRejected
//!                        └──► TissueEvaluating ──┬──► TissueRejected
//!                                                └──► Saved
//! ```
//!
//! A task opens its own slide handle, decodes its region, and drops the handle
//! before returning. Tasks share no mutable state and write disjoint files, so
//! they run concurrently on a bounded pool: a task is only spawned once a
//! semaphore permit is available, which caps in-flight decodes at `workers`.
//! Any failure (open, decode, write) is confined to its task and reported as a
//! warning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::encode::ImageEncoder;
use crate::error::TilingError;
use crate::grid::{ChunkGrid, ChunkRect, ChunkSize};
use crate::shutdown::ShutdownSignal;
use crate::slide::SlideOpener;
use crate::tissue::{TissueFilter, TissueVerdict};

/// Default minimum decoded width and height of a patch.
pub const DEFAULT_MIN_PATCH_SIZE: u32 = 448;

/// Default grid stride for patch extraction.
pub const DEFAULT_PATCH_CHUNK_SIZE: u32 = 448;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExtractConfig {
    /// Grid stride and requested region size
    pub chunk_size: ChunkSize,

    /// Regions narrower or shorter than this are discarded
    pub min_patch_size: u32,

    pub filter: TissueFilter,

    pub encoder: ImageEncoder,

    /// Maximum number of tasks in flight
    pub workers: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::square(DEFAULT_PATCH_CHUNK_SIZE),
            min_patch_size: DEFAULT_MIN_PATCH_SIZE,
            filter: TissueFilter::default(),
            encoder: ImageEncoder::default(),
            workers: default_workers(),
        }
    }
}

/// Number of workers matching the available CPU parallelism.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// =============================================================================
// Tasks
// =============================================================================

/// The unit of concurrent dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub slide_path: PathBuf,
    pub rect: ChunkRect,
    pub output_dir: PathBuf,
}

impl TaskDescriptor {
    /// Patch file path: `<output_dir>/<x>_<y>.<ext>`.
    pub fn patch_path(&self, extension: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.{}", self.rect.x, self.rect.y, extension))
    }
}

/// Terminal state of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    SizeRejected,
    TissueRejected { verdict: TissueVerdict },
    Saved { path: PathBuf, verdict: TissueVerdict },
    Failed { reason: String },
}

/// Run a single task to completion. Never fails; errors become `Failed`.
pub async fn run_task<O: SlideOpener + ?Sized>(
    opener: &O,
    task: &TaskDescriptor,
    config: &ExtractConfig,
) -> TaskOutcome {
    match process_task(opener, task, config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                "Skipping chunk ({}, {}) of {}: {}",
                task.rect.x,
                task.rect.y,
                task.slide_path.display(),
                e
            );
            TaskOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}

async fn process_task<O: SlideOpener + ?Sized>(
    opener: &O,
    task: &TaskDescriptor,
    config: &ExtractConfig,
) -> Result<TaskOutcome, TilingError> {
    let rect = task.rect;
    let min = config.min_patch_size;

    // Decoded regions always match the requested size, so undersized edge
    // chunks are rejected without touching the slide.
    if rect.width < min || rect.height < min {
        return Ok(TaskOutcome::SizeRejected);
    }

    let region = {
        let slide = opener.open(&task.slide_path).await?;
        slide
            .read_region(rect.x, rect.y, 0, rect.width, rect.height)
            .await?
    };

    if region.width() < min || region.height() < min {
        return Ok(TaskOutcome::SizeRejected);
    }

    let filter = config.filter;
    let encoder = config.encoder;
    let path = task.patch_path(encoder.extension());

    tokio::task::spawn_blocking(move || {
        let verdict = filter.evaluate_image(&region);
        if !verdict.keep {
            return Ok(TaskOutcome::TissueRejected { verdict });
        }
        encoder.save(&region, &path)?;
        Ok(TaskOutcome::Saved { path, verdict })
    })
    .await
    .map_err(|e| TilingError::Worker {
        message: e.to_string(),
    })?
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one evaluated or rejected chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecord {
    pub rect: ChunkRect,
    pub outcome: TaskOutcome,
}

/// Summary of one slide's extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionReport {
    pub slide: PathBuf,
    pub width: u32,
    pub height: u32,
    pub chunks: usize,
    pub saved: usize,
    pub size_rejected: usize,
    pub tissue_rejected: usize,
    pub failed: usize,

    /// Set when shutdown stopped dispatch before every chunk was scheduled
    pub cancelled: bool,

    /// Per-chunk outcomes, row-major by chunk origin
    pub regions: Vec<RegionRecord>,
}

impl ExtractionReport {
    fn new(slide: &Path, grid: &ChunkGrid) -> Self {
        let (width, height) = grid.dimensions();
        Self {
            slide: slide.to_path_buf(),
            width,
            height,
            chunks: grid.len(),
            saved: 0,
            size_rejected: 0,
            tissue_rejected: 0,
            failed: 0,
            cancelled: false,
            regions: Vec::with_capacity(grid.len()),
        }
    }

    fn record(&mut self, rect: ChunkRect, outcome: TaskOutcome) {
        match &outcome {
            TaskOutcome::SizeRejected => self.size_rejected += 1,
            TaskOutcome::TissueRejected { .. } => self.tissue_rejected += 1,
            TaskOutcome::Saved { .. } => self.saved += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
        }
        self.regions.push(RegionRecord { rect, outcome });
    }

    /// Paths of saved patches, row-major.
    pub fn saved_paths(&self) -> Vec<&Path> {
        self.regions
            .iter()
            .filter_map(|r| match &r.outcome {
                TaskOutcome::Saved { path, .. } => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Runs the extraction pipeline for one slide at a time.
pub struct TileExtractor<O: SlideOpener + 'static> {
    opener: Arc<O>,
    config: ExtractConfig,
    shutdown: ShutdownSignal,
}

impl<O: SlideOpener + 'static> TileExtractor<O> {
    pub fn new(opener: Arc<O>, config: ExtractConfig) -> Self {
        Self {
            opener,
            config,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Stop dispatching new tasks once `shutdown` is triggered.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    /// Extract tissue patches of `slide_path` into `output_dir`.
    ///
    /// # Errors
    ///
    /// Fails only before any task starts: the slide cannot be opened, its
    /// geometry is degenerate, or `output_dir` cannot be created. Per-chunk
    /// failures are counted in the report instead.
    pub async fn extract(
        &self,
        slide_path: &Path,
        output_dir: &Path,
    ) -> Result<ExtractionReport, TilingError> {
        let (width, height) = self.opener.open(slide_path).await?.dimensions();
        let grid = ChunkGrid::partition(width, height, self.config.chunk_size)?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| TilingError::io(output_dir, e))?;

        info!(
            "Extracting {} ({}x{}): {} chunks, {} workers",
            slide_path.display(),
            width,
            height,
            grid.len(),
            self.config.workers.max(1)
        );

        let mut report = ExtractionReport::new(slide_path, &grid);
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for rect in grid.rects() {
            if self.shutdown.is_triggered() {
                warn!("Shutdown requested, stopping dispatch for {}", slide_path.display());
                report.cancelled = true;
                break;
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            let task = TaskDescriptor {
                slide_path: slide_path.to_path_buf(),
                rect,
                output_dir: output_dir.to_path_buf(),
            };
            let opener = Arc::clone(&self.opener);
            let config = self.config;

            tasks.spawn(async move {
                let outcome = run_task(&*opener, &task, &config).await;
                drop(permit);
                (task.rect, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((rect, outcome)) => {
                    debug!("Chunk ({}, {}): {:?}", rect.x, rect.y, outcome);
                    report.record(rect, outcome);
                }
                Err(e) => {
                    warn!("Extraction task for {} aborted: {}", slide_path.display(), e);
                    report.failed += 1;
                }
            }
        }

        report.regions.sort_by_key(|r| (r.rect.y, r.rect.x));

        info!(
            "Finished {}: {} saved, {} too small, {} without tissue, {} failed",
            slide_path.display(),
            report.saved,
            report.size_rejected,
            report.tissue_rejected,
            report.failed
        );

        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================
