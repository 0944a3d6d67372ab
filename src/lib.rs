//! # WSI Tiler
//!
//! Chunked processing of gigapixel Whole Slide Images (WSI).
//!
//! Slides are far too large to decode at once, so every operation reads them
//! in fixed-size regions laid out on an exact grid. Two products are derived:
//!
//! - **tissue patches**: grid regions that pass a luminance tissue filter,
//!   written as `<x>_<y>.<ext>` files for downstream training pipelines
//! - **composites**: one fixed-size downsampled image per slide, assembled
//!   from independently resampled chunks
//!
//! ## Architecture
//!
//! - [`grid`] - chunk grid partitioning
//! - [`tissue`] - tissue/background classification of regions
//! - [`pipeline`] - patch extraction and composite pipelines
//! - [`batch`] - slide discovery and batch driver
//! - [`slide`] - slide traits and the pyramidal TIFF/SVS reader
//! - [`io`] - byte-range reads from local files
//! - [`encode`] - PNG/JPEG output
//! - [`config`] - CLI configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use wsi_tiler::{ExtractConfig, TiffSlideOpener, TileExtractor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let extractor = TileExtractor::new(Arc::new(TiffSlideOpener::new()), ExtractConfig::default());
//!     let report = extractor
//!         .extract(Path::new("slides/case-1/slide.svs"), Path::new("patches/case-1"))
//!         .await
//!         .unwrap();
//!     println!("{} patches saved", report.saved);
//! }
//! ```

pub mod batch;
pub mod config;
pub mod encode;
pub mod error;
pub mod grid;
pub mod io;
pub mod pipeline;
pub mod shutdown;
pub mod slide;
pub mod tissue;

// Re-export commonly used types
pub use batch::{
    discover_slides, BatchConfig, BatchDriver, BatchReport, DiscoveryMode, SlideJob, SlideResult,
};
pub use config::{Cli, Command, ComposeArgs, ExtractArgs};
pub use encode::{ImageEncoder, OutputFormat};
pub use error::{BatchError, IoError, SlideError, TiffError, TilingError};
pub use grid::{ChunkGrid, ChunkRect, ChunkSize, GridCell};
pub use io::{LocalFileReader, RangeReader};
pub use pipeline::{
    ChunkedCompositor, Composite, CompositeConfig, CompositeReport, ExtractConfig,
    ExtractionReport, PastePlan, TaskDescriptor, TaskOutcome, TileExtractor,
};
pub use shutdown::ShutdownSignal;
pub use slide::{Slide, SlideOpener, TiffSlide, TiffSlideOpener};
pub use tissue::{TissueFilter, TissueVerdict};
