//! Command-line configuration for the `wsi-tiler` binary.
//!
//! Every option can also be set through an environment variable with the
//! `WSI_` prefix, e.g. `WSI_INPUT`, `WSI_OUTPUT`, `WSI_WORKERS`,
//! `WSI_TARGET_SIZE` or `WSI_JPEG_QUALITY`.
//!
//! The CLI only checks that folders exist and that sizes and counts are
//! non-zero. The parsed arguments are turned into the library's
//! [`BatchConfig`], [`ExtractConfig`] and [`CompositeConfig`] values, so the
//! pipelines never read global state.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::batch::{
    BatchConfig, DiscoveryMode, DEFAULT_COMPOSE_EXTENSIONS, DEFAULT_EXTRACT_EXTENSIONS,
};
use crate::encode::{is_valid_quality, ImageEncoder, OutputFormat, DEFAULT_JPEG_QUALITY};
use crate::grid::ChunkSize;
use crate::pipeline::{
    default_workers, CompositeConfig, ExtractConfig, DEFAULT_COMPOSITE_CHUNK_SIZE,
    DEFAULT_MIN_PATCH_SIZE, DEFAULT_PATCH_CHUNK_SIZE, DEFAULT_TARGET_HEIGHT, DEFAULT_TARGET_WIDTH,
};
use crate::tissue::{
    TissueFilter, DEFAULT_BACKGROUND_FRACTION, DEFAULT_BACKGROUND_THRESHOLD,
    DEFAULT_TISSUE_FRACTION, DEFAULT_TISSUE_THRESHOLD,
};

/// Default number of slides processed concurrently.
pub const DEFAULT_SLIDE_JOBS: usize = 1;

// =============================================================================
// CLI Arguments
// =============================================================================

/// WSI Tiler - tissue patches and composites from Whole Slide Images.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-tiler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Extract tissue patches from every slide into per-slide folders.
    Extract(ExtractArgs),

    /// Write one downsampled composite image per slide.
    Compose(ComposeArgs),
}

impl Command {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Command::Extract(args) => args.validate(),
            Command::Compose(args) => args.validate(),
        }
    }

    pub fn verbose(&self) -> bool {
        match self {
            Command::Extract(args) => args.common.verbose,
            Command::Compose(args) => args.common.verbose,
        }
    }
}

/// Options shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Root folder containing the slides.
    #[arg(short, long, env = "WSI_INPUT")]
    pub input: PathBuf,

    /// Output folder (created if missing).
    #[arg(short, long, env = "WSI_OUTPUT")]
    pub output: PathBuf,

    /// Number of slides processed at once. Capped at --workers for
    /// extract; the only parallelism knob for compose.
    #[arg(long, default_value_t = DEFAULT_SLIDE_JOBS, env = "WSI_SLIDE_JOBS")]
    pub slide_jobs: usize,

    /// Output image format (png or jpeg).
    #[arg(long, default_value = "png", env = "WSI_FORMAT")]
    pub format: OutputFormat,

    /// JPEG quality (1-100), used with --format jpeg.
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "WSI_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Write a JSON run report to this file.
    #[arg(long, env = "WSI_REPORT")]
    pub report: Option<PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CommonArgs {
    fn validate(&self) -> Result<(), String> {
        if !self.input.is_dir() {
            return Err(format!("Input folder not found: {}", self.input.display()));
        }
        if self.slide_jobs == 0 {
            return Err("slide_jobs must be greater than 0".to_string());
        }
        if !is_valid_quality(self.jpeg_quality) {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        Ok(())
    }

    fn encoder(&self) -> ImageEncoder {
        ImageEncoder {
            format: self.format,
            jpeg_quality: self.jpeg_quality,
        }
    }

    fn batch_config(&self, discovery: DiscoveryMode, extensions: &[String]) -> BatchConfig {
        BatchConfig {
            input: self.input.clone(),
            output: self.output.clone(),
            discovery,
            extensions: extensions.to_vec(),
            slide_jobs: self.slide_jobs,
            report: self.report.clone(),
        }
    }
}

// =============================================================================
// Extract
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// How slides are located under the input folder.
    #[arg(long, value_enum, default_value_t = DiscoveryMode::PerFolder, env = "WSI_DISCOVERY")]
    pub discovery: DiscoveryMode,

    /// Slide file extensions (comma-separated).
    #[arg(long, value_delimiter = ',', default_values_t = default_extensions(DEFAULT_EXTRACT_EXTENSIONS), env = "WSI_EXTENSIONS")]
    pub extensions: Vec<String>,

    /// Grid stride, as `N` or `WxH`.
    #[arg(long, value_parser = parse_size, default_value_t = SizeArg::square(DEFAULT_PATCH_CHUNK_SIZE), env = "WSI_CHUNK_SIZE")]
    pub chunk_size: SizeArg,

    /// Patches narrower or shorter than this are discarded.
    #[arg(long, default_value_t = DEFAULT_MIN_PATCH_SIZE, env = "WSI_MIN_PATCH_SIZE")]
    pub min_patch_size: u32,

    /// Mean intensity below which a pixel counts as tissue.
    #[arg(long, default_value_t = DEFAULT_TISSUE_THRESHOLD, env = "WSI_TISSUE_THRESHOLD")]
    pub tissue_threshold: u8,

    /// Mean intensity below which a pixel counts as dark background.
    #[arg(long, default_value_t = DEFAULT_BACKGROUND_THRESHOLD, env = "WSI_BACKGROUND_THRESHOLD")]
    pub background_threshold: u8,

    /// Minimum tissue fraction for a patch to be kept.
    #[arg(long, default_value_t = DEFAULT_TISSUE_FRACTION, env = "WSI_TISSUE_FRACTION")]
    pub tissue_fraction: f64,

    /// Dark background fraction above which a patch is rejected.
    #[arg(long, default_value_t = DEFAULT_BACKGROUND_FRACTION, env = "WSI_BACKGROUND_FRACTION")]
    pub background_fraction: f64,

    /// Total decode workers across all slides (defaults to the CPU count).
    #[arg(long, env = "WSI_WORKERS")]
    pub workers: Option<usize>,
}

impl ExtractArgs {
    /// Validate the arguments and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.common.validate()?;

        if self.chunk_size.width == 0 || self.chunk_size.height == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if self.workers == Some(0) {
            return Err("workers must be greater than 0".to_string());
        }
        if self.extensions.is_empty() {
            return Err("at least one slide extension is required".to_string());
        }
        Ok(())
    }

    pub fn batch_config(&self) -> BatchConfig {
        self.common.batch_config(self.discovery, &self.extensions)
    }

    pub fn extract_config(&self) -> ExtractConfig {
        ExtractConfig {
            chunk_size: self.chunk_size.into(),
            min_patch_size: self.min_patch_size,
            filter: TissueFilter {
                tissue_threshold: self.tissue_threshold,
                background_threshold: self.background_threshold,
                tissue_fraction: self.tissue_fraction,
                background_fraction: self.background_fraction,
            },
            encoder: self.common.encoder(),
            workers: self.workers.unwrap_or_else(default_workers),
        }
    }
}

// =============================================================================
// Compose
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ComposeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// How slides are located under the input folder.
    #[arg(long, value_enum, default_value_t = DiscoveryMode::Flat, env = "WSI_DISCOVERY")]
    pub discovery: DiscoveryMode,

    /// Slide file extensions (comma-separated).
    #[arg(long, value_delimiter = ',', default_values_t = default_extensions(DEFAULT_COMPOSE_EXTENSIONS), env = "WSI_EXTENSIONS")]
    pub extensions: Vec<String>,

    /// Composite size, as `WxH` or `N`.
    #[arg(long, value_parser = parse_size, default_value_t = SizeArg::new(DEFAULT_TARGET_WIDTH, DEFAULT_TARGET_HEIGHT), env = "WSI_TARGET_SIZE")]
    pub target_size: SizeArg,

    /// Read chunk size, as `WxH` or `N`.
    #[arg(long, value_parser = parse_size, default_value_t = SizeArg::square(DEFAULT_COMPOSITE_CHUNK_SIZE), env = "WSI_CHUNK_SIZE")]
    pub chunk_size: SizeArg,

    /// Canvas fill colour, as `r,g,b`.
    #[arg(long, value_parser = parse_rgb, default_value = "0,0,0", env = "WSI_BACKGROUND")]
    pub background: [u8; 3],
}

impl ComposeArgs {
    /// Validate the arguments and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.common.validate()?;

        if self.target_size.width == 0 || self.target_size.height == 0 {
            return Err("target_size must be greater than 0".to_string());
        }
        if self.chunk_size.width == 0 || self.chunk_size.height == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if self.extensions.is_empty() {
            return Err("at least one slide extension is required".to_string());
        }
        Ok(())
    }

    pub fn batch_config(&self) -> BatchConfig {
        self.common.batch_config(self.discovery, &self.extensions)
    }

    pub fn composite_config(&self) -> CompositeConfig {
        CompositeConfig {
            target: (self.target_size.width, self.target_size.height),
            chunk_size: self.chunk_size.into(),
            background: self.background,
            encoder: self.common.encoder(),
        }
    }
}

// =============================================================================
// Value Parsers
// =============================================================================

/// A `WxH` size argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeArg {
    pub width: u32,
    pub height: u32,
}

impl SizeArg {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

impl std::fmt::Display for SizeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<SizeArg> for ChunkSize {
    fn from(size: SizeArg) -> Self {
        ChunkSize::new(size.width, size.height)
    }
}

/// Parse `WxH` (or `W×H`, `W,H`) or a single `N` for a square size.
pub fn parse_size(s: &str) -> Result<SizeArg, String> {
    let s = s.trim();
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid size '{}': expected N or WxH", s))
    };

    match s.split_once(['x', 'X', '×', ',']) {
        Some((w, h)) => Ok(SizeArg::new(parse(w)?, parse(h)?)),
        None => Ok(SizeArg::square(parse(s)?)),
    }
}

/// Parse an `r,g,b` colour.
pub fn parse_rgb(s: &str) -> Result<[u8; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        return Err(format!("invalid colour '{}': expected r,g,b", s));
    };

    let channel = |v: &str| {
        v.parse::<u8>()
            .map_err(|_| format!("invalid colour '{}': channels must be 0-255", s))
    };
    Ok([channel(*r)?, channel(*g)?, channel(*b)?])
}

fn default_extensions(list: &[&str]) -> Vec<String> {
    list.iter().map(|e| e.to_string()).collect()
}

// =============================================================================
// Tests
// =============================================================================
