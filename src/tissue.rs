//! Tissue / background classification of decoded regions.
//!
//! The filter is a luminance heuristic, not a segmentation. It looks at the
//! mean intensity of each pixel across its channels and counts two populations:
//!
//! - **background**: very dark pixels (mean below `background_threshold`),
//!   typically out-of-slide areas or scanner padding
//! - **tissue**: anything darker than the bright glass background (mean below
//!   `tissue_threshold`)
//!
//! A region is discarded outright when dark background covers more than
//! `background_fraction` of it. Otherwise it is kept when tissue covers at
//! least `tissue_fraction` of it. All four numbers are tuning knobs chosen
//! empirically for H&E slides.

use image::RgbImage;
use serde::Serialize;

/// Default mean intensity below which a pixel counts as tissue.
pub const DEFAULT_TISSUE_THRESHOLD: u8 = 200;

/// Default mean intensity below which a pixel counts as dark background.
pub const DEFAULT_BACKGROUND_THRESHOLD: u8 = 10;

/// Default minimum fraction of tissue pixels for a region to be kept.
pub const DEFAULT_TISSUE_FRACTION: f64 = 0.6;

/// Default fraction of dark background pixels above which a region is rejected.
pub const DEFAULT_BACKGROUND_FRACTION: f64 = 0.2;

/// Number of interleaved channels in the pixel buffers the filter accepts.
const CHANNELS: usize = 3;

// =============================================================================
// Verdict
// =============================================================================

/// Result of evaluating one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TissueVerdict {
    /// Pixels counted as tissue (0 when background dominates)
    pub tissue_area: u64,

    /// Pixels counted as dark background
    pub background_area: u64,

    /// Total pixels in the region
    pub region_area: u64,

    /// Whether the region qualifies as a patch
    pub keep: bool,
}

// =============================================================================
// Filter
// =============================================================================

/// Two-threshold luminance filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TissueFilter {
    pub tissue_threshold: u8,
    pub background_threshold: u8,
    pub tissue_fraction: f64,
    pub background_fraction: f64,
}

impl Default for TissueFilter {
    fn default() -> Self {
        Self {
            tissue_threshold: DEFAULT_TISSUE_THRESHOLD,
            background_threshold: DEFAULT_BACKGROUND_THRESHOLD,
            tissue_fraction: DEFAULT_TISSUE_FRACTION,
            background_fraction: DEFAULT_BACKGROUND_FRACTION,
        }
    }
}

impl TissueFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate an interleaved 8-bit RGB buffer of `width x height` pixels.
    ///
    /// Only the first `width * height` pixels are considered; a shorter buffer
    /// is evaluated over the pixels it holds against the full nominal area.
    pub fn evaluate(&self, pixels: &[u8], width: u32, height: u32) -> TissueVerdict {
        let region_area = u64::from(width) * u64::from(height);

        // mean < t  <=>  sum < t * channels, which keeps the comparison exact
        let background_limit = u32::from(self.background_threshold) * CHANNELS as u32;
        let tissue_limit = u32::from(self.tissue_threshold) * CHANNELS as u32;

        let mut background_area = 0u64;
        let mut tissue_area = 0u64;
        for px in pixels.chunks_exact(CHANNELS).take(region_area as usize) {
            let sum: u32 = px.iter().map(|&c| u32::from(c)).sum();
            if sum < background_limit {
                background_area += 1;
            }
            if sum < tissue_limit {
                tissue_area += 1;
            }
        }

        let area = region_area as f64;
        if background_area as f64 > area * self.background_fraction {
            return TissueVerdict {
                tissue_area: 0,
                background_area,
                region_area,
                keep: false,
            };
        }

        TissueVerdict {
            tissue_area,
            background_area,
            region_area,
            keep: region_area > 0 && tissue_area as f64 >= area * self.tissue_fraction,
        }
    }

    /// Evaluate a decoded RGB region.
    pub fn evaluate_image(&self, image: &RgbImage) -> TissueVerdict {
        self.evaluate(image.as_raw(), image.width(), image.height())
    }
}

// =============================================================================
// Tests
// =============================================================================
