//! Downsampled slide composites.
//!
//! The compositor walks the chunk grid in row-major order, resamples every
//! decoded chunk on its own and pastes it into one fixed-size canvas. Two
//! scale factors are involved:
//!
//! - the **actual** factor, derived from the chunk's decoded size, sets the
//!   resampled dimensions
//! - the **nominal** factor, derived from the configured chunk size, sets the
//!   paste offset as `col * nominal` / `row * nominal`
//!
//! Offsets therefore stay on the grid even for truncated edge chunks, at the
//! cost of rounding seams: neighbouring pastes may overlap by a pixel or leave
//! a thin strip of background at the far edges. Downstream consumers rely on
//! this exact layout, so it is kept as is.
//!
//! Chunks are processed sequentially; the canvas is the only mutable state.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::encode::ImageEncoder;
use crate::error::TilingError;
use crate::grid::{ChunkGrid, ChunkSize, GridCell};
use crate::slide::{Slide, SlideOpener};

/// Default composite width.
pub const DEFAULT_TARGET_WIDTH: u32 = 4000;

/// Default composite height.
pub const DEFAULT_TARGET_HEIGHT: u32 = 3000;

/// Default read chunk edge for compositing.
pub const DEFAULT_COMPOSITE_CHUNK_SIZE: u32 = 512;

/// Default canvas fill, matching an empty RGB canvas.
pub const DEFAULT_BACKGROUND: [u8; 3] = [0, 0, 0];

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompositeConfig {
    /// Canvas size as `(width, height)`
    pub target: (u32, u32),

    pub chunk_size: ChunkSize,

    /// Fill colour of canvas areas no chunk was pasted into
    pub background: [u8; 3],

    pub encoder: ImageEncoder,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            target: (DEFAULT_TARGET_WIDTH, DEFAULT_TARGET_HEIGHT),
            chunk_size: ChunkSize::square(DEFAULT_COMPOSITE_CHUNK_SIZE),
            background: DEFAULT_BACKGROUND,
            encoder: ImageEncoder::default(),
        }
    }
}

// =============================================================================
// Paste Geometry
// =============================================================================

/// Where and how large one chunk lands on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PastePlan {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub paste_x: u32,
    pub paste_y: u32,
}

impl PastePlan {
    /// Plan the paste of `cell` whose decoded region is `actual` pixels.
    ///
    /// Returns `None` when either scaled extent rounds down to zero.
    pub fn for_cell(
        cell: &GridCell,
        actual: (u32, u32),
        slide: (u32, u32),
        chunk: ChunkSize,
        target: (u32, u32),
    ) -> Option<Self> {
        let scaled_width = scale(actual.0, slide.0, target.0);
        let scaled_height = scale(actual.1, slide.1, target.1);
        if scaled_width == 0 || scaled_height == 0 {
            return None;
        }

        Some(Self {
            scaled_width,
            scaled_height,
            paste_x: cell.col * scale(chunk.width, slide.0, target.0),
            paste_y: cell.row * scale(chunk.height, slide.1, target.1),
        })
    }
}

/// `floor(length / slide * target)`, computed in floating point.
fn scale(length: u32, slide: u32, target: u32) -> u32 {
    (f64::from(length) / f64::from(slide) * f64::from(target)).floor() as u32
}

// =============================================================================
// Report
// =============================================================================

/// Summary of one composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeReport {
    pub slide: String,
    pub width: u32,
    pub height: u32,
    pub target: (u32, u32),
    pub chunks: usize,
    pub pasted: usize,

    /// Chunks whose scaled size rounded to zero
    pub skipped_degenerate: usize,

    /// Chunks that failed to decode (left at background)
    pub failed: usize,

    pub output: Option<PathBuf>,
}

/// A finished canvas and its report.
#[derive(Debug, Clone)]
pub struct Composite {
    pub canvas: RgbImage,
    pub report: CompositeReport,
}

// =============================================================================
// Compositor
// =============================================================================

/// Builds one composite per slide.
#[derive(Debug, Clone, Default)]
pub struct ChunkedCompositor {
    config: CompositeConfig,
}

impl ChunkedCompositor {
    pub fn new(config: CompositeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompositeConfig {
        &self.config
    }

    /// Compose an opened slide into a canvas of the configured target size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimensions` for an empty slide, chunk or target. Chunk
    /// decode failures are logged and leave background behind.
    pub async fn compose(&self, slide: &dyn Slide) -> Result<Composite, TilingError> {
        let (width, height) = slide.dimensions();
        let (target_w, target_h) = self.config.target;
        let chunk = self.config.chunk_size;

        if target_w == 0 || target_h == 0 {
            return Err(TilingError::InvalidDimensions {
                width: target_w,
                height: target_h,
                chunk_width: chunk.width,
                chunk_height: chunk.height,
            });
        }
        let grid = ChunkGrid::partition(width, height, chunk)?;

        debug!(
            "Composing {} ({}x{}) into {}x{} from {} chunks",
            slide.identifier(),
            width,
            height,
            target_w,
            target_h,
            grid.len()
        );

        let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb(self.config.background));
        let mut report = CompositeReport {
            slide: slide.identifier().to_string(),
            width,
            height,
            target: self.config.target,
            chunks: grid.len(),
            pasted: 0,
            skipped_degenerate: 0,
            failed: 0,
            output: None,
        };

        for cell in grid.cells() {
            let rect = cell.rect;
            let region = match slide
                .read_region(rect.x, rect.y, 0, rect.width, rect.height)
                .await
            {
                Ok(region) => region,
                Err(e) => {
                    warn!(
                        "Skipping chunk ({}, {}) of {}: {}",
                        rect.x,
                        rect.y,
                        slide.identifier(),
                        e
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let Some(plan) = PastePlan::for_cell(
                &cell,
                region.dimensions(),
                (width, height),
                chunk,
                self.config.target,
            ) else {
                report.skipped_degenerate += 1;
                continue;
            };

            let resized = tokio::task::spawn_blocking(move || {
                imageops::resize(
                    &region,
                    plan.scaled_width,
                    plan.scaled_height,
                    FilterType::Lanczos3,
                )
            })
            .await
            .map_err(|e| TilingError::Worker {
                message: e.to_string(),
            })?;

            imageops::replace(
                &mut canvas,
                &resized,
                i64::from(plan.paste_x),
                i64::from(plan.paste_y),
            );
            report.pasted += 1;
        }

        if report.pasted == 0 {
            warn!("No chunk of {} could be pasted", slide.identifier());
        }

        Ok(Composite { canvas, report })
    }

    /// Open `slide_path`, compose it and write `<stem>.<ext>` into `output_dir`.
    pub async fn compose_file<O: SlideOpener + ?Sized>(
        &self,
        opener: &O,
        slide_path: &Path,
        output_dir: &Path,
    ) -> Result<CompositeReport, TilingError> {
        let Composite { canvas, mut report } = {
            let slide = opener.open(slide_path).await?;
            self.compose(&*slide).await?
        };

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| TilingError::io(output_dir, e))?;

        let encoder = self.config.encoder;
        let path = composite_path(slide_path, output_dir, encoder.extension());
        let target = path.clone();
        tokio::task::spawn_blocking(move || encoder.save(&canvas, &target))
            .await
            .map_err(|e| TilingError::Worker {
                message: e.to_string(),
            })??;

        info!(
            "Composite of {} written to {} ({} of {} chunks pasted)",
            slide_path.display(),
            path.display(),
            report.pasted,
            report.chunks
        );

        report.output = Some(path);
        Ok(report)
    }
}

/// `<output_dir>/<slide stem>.<ext>`.
pub fn composite_path(slide_path: &Path, output_dir: &Path, extension: &str) -> PathBuf {
    let stem = slide_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "slide".to_string());
    output_dir.join(format!("{}.{}", stem, extension))
}

// =============================================================================
// Tests
// =============================================================================
