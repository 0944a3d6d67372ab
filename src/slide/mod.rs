//! Slide access layer.
//!
//! The pipelines depend only on the [`Slide`] and [`SlideOpener`] traits. The
//! bundled implementation reads local pyramidal TIFF and Aperio SVS files:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Extraction / Composite pipelines    │
//! └────────────────────┬────────────────────┘
//!                      │ SlideOpener::open, Slide::read_region
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │               TiffSlide                 │
//! │  (pyramid levels, tile LRU, JPEG/raw)   │
//! └────────────────────┬────────────────────┘
//!                      │ RangeReader::read_exact_at
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │            LocalFileReader              │
//! └─────────────────────────────────────────┘
//! ```

mod jpeg;
mod reader;
mod tiff;
mod tiff_slide;

pub use jpeg::{is_abbreviated_stream, merge_jpeg_tables, prepare_tile_jpeg};
pub use reader::{Slide, SlideOpener};
pub use tiff::{ByteOrder, TiffHeader};
pub use tiff_slide::{TiffSlide, TiffSlideOpener, DEFAULT_TILE_CACHE_TILES};
