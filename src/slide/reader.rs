//! Format-agnostic slide access.
//!
//! The tiling pipelines only ever talk to slides through these two traits:
//! [`SlideOpener`] turns a path into a handle, [`Slide`] reports dimensions and
//! decodes rectangular regions. A handle is closed when it is dropped.

use std::path::Path;

use async_trait::async_trait;
use image::RgbImage;

use crate::error::SlideError;

/// An opened Whole Slide Image.
///
/// Handles are not shared between concurrent extraction tasks; each task
/// opens its own through a [`SlideOpener`] and drops it when done.
#[async_trait]
pub trait Slide: Send + Sync {
    /// Identifier for logging (usually the file path).
    fn identifier(&self) -> &str;

    /// Number of pyramid levels. Level 0 is full resolution.
    fn level_count(&self) -> usize;

    /// Dimensions of a level in pixels, `None` if out of range.
    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)>;

    /// Dimensions of the full-resolution (level 0) image.
    fn dimensions(&self) -> (u32, u32) {
        self.level_dimensions(0).unwrap_or((0, 0))
    }

    /// Downsample factor of a level relative to level 0.
    fn level_downsample(&self, level: usize) -> Option<f64> {
        let (base_width, _) = self.level_dimensions(0)?;
        let (width, _) = self.level_dimensions(level)?;
        if width == 0 {
            return None;
        }
        Some(f64::from(base_width) / f64::from(width))
    }

    /// Decode a region into an RGB buffer.
    ///
    /// `x` and `y` are level-0 coordinates of the top-left corner; `width` and
    /// `height` are in pixels of `level`. Pixels outside the level are black.
    async fn read_region(
        &self,
        x: u32,
        y: u32,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, SlideError>;
}

/// Opens slides by path.
#[async_trait]
pub trait SlideOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn Slide>, SlideError>;
}
