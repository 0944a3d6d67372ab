//! Output image encoding.
//!
//! Patches and composites are written either as PNG (lossless, the default) or
//! as JPEG at a configurable quality. Encoding happens in memory first so a
//! failed encode never leaves a truncated file behind.

use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder as _, RgbImage};
use serde::Serialize;

use crate::error::TilingError;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

// =============================================================================
// Output Format
// =============================================================================

/// Image container written for patches and composites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    /// File extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Png => write!(f, "png"),
            OutputFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            other => Err(format!("unknown output format '{}' (expected png or jpeg)", other)),
        }
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Encodes RGB buffers and writes them to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageEncoder {
    pub format: OutputFormat,
    pub jpeg_quality: u8,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(OutputFormat::Png)
    }
}

impl ImageEncoder {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    /// JPEG encoder at the given quality (clamped to 1-100).
    pub fn jpeg(quality: u8) -> Self {
        Self {
            format: OutputFormat::Jpeg,
            jpeg_quality: clamp_quality(quality),
        }
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    /// Encode an RGB image into the configured container.
    pub fn encode(&self, image: &RgbImage) -> Result<Bytes, TilingError> {
        let mut output = Cursor::new(Vec::new());
        let (width, height) = image.dimensions();

        let result = match self.format {
            OutputFormat::Png => PngEncoder::new(&mut output).write_image(
                image.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            ),
            OutputFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut output, clamp_quality(self.jpeg_quality))
                    .encode_image(image)
            }
        };

        result.map_err(|e| TilingError::Encode {
            message: e.to_string(),
        })?;

        Ok(Bytes::from(output.into_inner()))
    }

    /// Encode and write an image to `path`.
    pub fn save(&self, image: &RgbImage, path: &Path) -> Result<(), TilingError> {
        let encoded = self.encode(image)?;
        std::fs::write(path, &encoded).map_err(|e| TilingError::io(path, e))
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Returns `true` if quality is in the valid range (1-100).
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&quality)
}

/// Clamp quality to the valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
