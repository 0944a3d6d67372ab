//! Batch processing over a folder of slides.
//!
//! The driver discovers slide files under an input root and runs one pipeline
//! invocation per slide. Slides are processed concurrently up to `slide_jobs`
//! at a time; for extraction the per-slide worker pool is shrunk accordingly so
//! the total number of in-flight decodes stays within the configured budget.
//!
//! A slide that cannot be opened or processed is logged and counted; the rest
//! of the batch carries on.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BatchError, TilingError};
use crate::pipeline::{
    ChunkedCompositor, CompositeConfig, CompositeReport, ExtractConfig, ExtractionReport,
    TileExtractor,
};
use crate::shutdown::ShutdownSignal;
use crate::slide::SlideOpener;

/// Default slide extensions for patch extraction.
pub const DEFAULT_EXTRACT_EXTENSIONS: &[&str] = &["svs"];

/// Default slide extensions for compositing.
pub const DEFAULT_COMPOSE_EXTENSIONS: &[&str] = &["svs", "tiff", "tif", "ndpi"];

// =============================================================================
// Discovery
// =============================================================================

/// How slide files are located under the input root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Files directly inside the root
    #[default]
    Flat,

    /// Every matching file below the root
    Recursive,

    /// The first matching file of each immediate sub-folder, named after it
    PerFolder,
}

/// One slide to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlideJob {
    pub path: PathBuf,

    /// Output name: the folder name in per-folder mode, the file stem otherwise
    pub name: String,
}

impl SlideJob {
    fn from_file(path: PathBuf) -> Self {
        let name = file_stem(&path);
        Self { path, name }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether `path` ends in one of `extensions` (case-insensitive, dots optional).
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Matching files directly inside `dir`, sorted by path.
fn matching_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, BatchError> {
    let entries = std::fs::read_dir(dir).map_err(|e| BatchError::io(dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| BatchError::io(dir, e))?.path();
        if path.is_file() && has_extension(&path, extensions) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Locate slide files under `root`.
///
/// Results are sorted so repeated runs visit slides in the same order.
pub fn discover_slides(
    root: &Path,
    mode: DiscoveryMode,
    extensions: &[String],
) -> Result<Vec<SlideJob>, BatchError> {
    if !root.is_dir() {
        return Err(BatchError::InputNotFound(root.to_path_buf()));
    }

    let jobs = match mode {
        DiscoveryMode::Flat => matching_files(root, extensions)?
            .into_iter()
            .map(SlideJob::from_file)
            .collect(),

        DiscoveryMode::Recursive => {
            let mut jobs = Vec::new();
            for entry in WalkDir::new(root).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                        continue;
                    }
                };
                if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                    jobs.push(SlideJob::from_file(entry.into_path()));
                }
            }
            jobs
        }

        DiscoveryMode::PerFolder => {
            let entries = std::fs::read_dir(root).map_err(|e| BatchError::io(root, e))?;
            let mut folders = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| BatchError::io(root, e))?.path();
                if path.is_dir() {
                    folders.push(path);
                }
            }
            folders.sort();

            let mut jobs = Vec::new();
            for folder in folders {
                match matching_files(&folder, extensions)?.into_iter().next() {
                    Some(path) => jobs.push(SlideJob {
                        path,
                        name: folder
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    }),
                    None => debug!("No slide found in {}", folder.display()),
                }
            }
            jobs
        }
    };

    Ok(jobs)
}

// =============================================================================
// Reports
// =============================================================================

/// Result of one slide within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct SlideResult<T> {
    pub name: String,
    pub path: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<T> {
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,

    /// Set when shutdown stopped the batch before every slide was dispatched
    pub cancelled: bool,

    /// Per-slide results, in discovery order
    pub slides: Vec<SlideResult<T>>,
}

impl<T> BatchReport<T> {
    fn empty() -> Self {
        Self {
            discovered: 0,
            succeeded: 0,
            failed: 0,
            cancelled: false,
            slides: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.discovered == 0
    }
}

impl<T: Serialize> BatchReport<T> {
    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), BatchError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| BatchError::io(path, std::io::Error::from(e)))?;
        std::fs::write(path, json).map_err(|e| BatchError::io(path, e))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Settings shared by both batch modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub discovery: DiscoveryMode,
    pub extensions: Vec<String>,

    /// Maximum number of slides processed at once.
    ///
    /// Extraction also caps this at its worker count. Composites have no
    /// worker pool, so this is the only concurrency bound for `compose`.
    pub slide_jobs: usize,

    /// Optional JSON report destination
    pub report: Option<PathBuf>,
}

impl BatchConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            discovery: DiscoveryMode::default(),
            extensions: DEFAULT_COMPOSE_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            slide_jobs: 1,
            report: None,
        }
    }
}

/// Runs a pipeline over every discovered slide.
pub struct BatchDriver {
    config: BatchConfig,
    shutdown: ShutdownSignal,
}

impl BatchDriver {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Stop dispatching slides (and extraction tasks) once triggered.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn slide_jobs(&self) -> usize {
        self.config.slide_jobs.max(1)
    }

    /// Split the extraction worker budget across concurrent slides.
    ///
    /// At most `workers` slides run at once, so `slide_jobs * per_slide`
    /// never exceeds `workers`.
    fn split_workers(&self, extract: ExtractConfig) -> (usize, ExtractConfig) {
        let workers = extract.workers.max(1);
        let slide_jobs = self.slide_jobs().min(workers);
        if slide_jobs < self.slide_jobs() {
            debug!(
                "Limiting slide jobs from {} to {} to stay within {} worker(s)",
                self.slide_jobs(),
                slide_jobs,
                workers
            );
        }
        let config = ExtractConfig {
            workers: workers / slide_jobs,
            ..extract
        };
        (slide_jobs, config)
    }

    /// Extract tissue patches from every slide into `<output>/<name>/`.
    pub async fn run_extraction<O: SlideOpener + 'static>(
        &self,
        opener: Arc<O>,
        extract: ExtractConfig,
    ) -> Result<BatchReport<ExtractionReport>, BatchError> {
        let jobs = self.prepare()?;

        let (slide_jobs, config) = self.split_workers(extract);
        debug!(
            "{} slide job(s), {} worker(s) per slide",
            slide_jobs, config.workers
        );

        let output = self.config.output.clone();
        let shutdown = self.shutdown.clone();
        let report = self
            .run_jobs(jobs, slide_jobs, move |job| {
                let extractor = TileExtractor::new(Arc::clone(&opener), config)
                    .with_shutdown(shutdown.clone());
                let slide_dir = output.join(&job.name);
                async move {
                    let report = extractor.extract(&job.path, &slide_dir).await?;
                    if report.saved == 0 {
                        warn!("No tissue patch saved for {}", job.path.display());
                    }
                    Ok(report)
                }
            })
            .await;

        self.finish(report)
    }

    /// Compose every slide into `<output>/<stem>.<ext>`.
    pub async fn run_composite<O: SlideOpener + 'static>(
        &self,
        opener: Arc<O>,
        composite: CompositeConfig,
    ) -> Result<BatchReport<CompositeReport>, BatchError> {
        let jobs = self.prepare()?;

        let compositor = ChunkedCompositor::new(composite);
        let output = self.config.output.clone();
        let report = self
            .run_jobs(jobs, self.slide_jobs(), move |job| {
                let opener = Arc::clone(&opener);
                let compositor = compositor.clone();
                let output = output.clone();
                async move { compositor.compose_file(&*opener, &job.path, &output).await }
            })
            .await;

        self.finish(report)
    }

    /// Check the input root, create the output root and discover slides.
    fn prepare(&self) -> Result<Vec<SlideJob>, BatchError> {
        let BatchConfig {
            input,
            output,
            discovery,
            extensions,
            ..
        } = &self.config;

        if !input.is_dir() {
            return Err(BatchError::InputNotFound(input.clone()));
        }
        std::fs::create_dir_all(output).map_err(|e| BatchError::io(output, e))?;

        let jobs = discover_slides(input, *discovery, extensions)?;
        if jobs.is_empty() {
            warn!(
                "No slide with extension {:?} found in {}",
                extensions,
                input.display()
            );
        } else {
            info!("Found {} slide(s) in {}", jobs.len(), input.display());
        }
        Ok(jobs)
    }

    async fn run_jobs<T, F, Fut>(
        &self,
        jobs: Vec<SlideJob>,
        concurrency: usize,
        run: F,
    ) -> BatchReport<T>
    where
        T: Send + 'static,
        F: Fn(SlideJob) -> Fut,
        Fut: Future<Output = Result<T, TilingError>> + Send + 'static,
    {
        let mut report = BatchReport::empty();
        report.discovered = jobs.len();

        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, job) in jobs.into_iter().enumerate() {
            if self.shutdown.is_triggered() {
                warn!("Shutdown requested, not starting remaining slides");
                report.cancelled = true;
                break;
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            let future = run(job.clone());
            tasks.spawn(async move {
                let result = future.await;
                drop(permit);
                (index, job, result)
            });
        }

        let mut results = Vec::with_capacity(report.discovered);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!("Slide job aborted: {}", e);
                    report.failed += 1;
                }
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        for (_, job, result) in results {
            let (slide_report, error) = match result {
                Ok(slide_report) => {
                    report.succeeded += 1;
                    (Some(slide_report), None)
                }
                Err(e) => {
                    warn!("Skipping slide {}: {}", job.path.display(), e);
                    report.failed += 1;
                    (None, Some(e.to_string()))
                }
            };
            report.slides.push(SlideResult {
                name: job.name,
                path: job.path,
                report: slide_report,
                error,
            });
        }

        report
    }

    fn finish<T: Serialize>(
        &self,
        report: BatchReport<T>,
    ) -> Result<BatchReport<T>, BatchError> {
        info!(
            "Batch finished: {} of {} slide(s) succeeded, {} failed",
            report.succeeded, report.discovered, report.failed
        );

        if let Some(path) = &self.config.report {
            report.write_json(path)?;
            info!("Report written to {}", path.display());
        }
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================
