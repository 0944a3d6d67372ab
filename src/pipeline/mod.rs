//! The two per-slide pipelines.
//!
//! - [`extract`]: concurrent tissue patch extraction into a per-slide folder
//! - [`composite`]: sequential downsampled composite of the whole slide
//!
//! Both read the slide in grid chunks produced by [`crate::grid::ChunkGrid`]
//! so memory stays bounded regardless of slide size.

pub mod composite;
pub mod extract;

pub use composite::{
    composite_path, ChunkedCompositor, Composite, CompositeConfig, CompositeReport, PastePlan,
    DEFAULT_BACKGROUND, DEFAULT_COMPOSITE_CHUNK_SIZE, DEFAULT_TARGET_HEIGHT, DEFAULT_TARGET_WIDTH,
};
pub use extract::{
    default_workers, run_task, ExtractConfig, ExtractionReport, RegionRecord, TaskDescriptor,
    TaskOutcome, TileExtractor, DEFAULT_MIN_PATCH_SIZE, DEFAULT_PATCH_CHUNK_SIZE,
};
