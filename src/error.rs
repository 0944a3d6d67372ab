use std::path::PathBuf;

use thiserror::Error;

/// I/O errors that can occur when reading slide bytes
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Underlying read failed
    #[error("Read error on {path}: {message}")]
    Read { path: String, message: String },

    /// File not found
    #[error("File not found: {0}")]
    NotFound(String),
}

/// Errors that can occur when parsing TIFF containers
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or loops back)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0} (only uncompressed and JPEG tiles are supported)")]
    UnsupportedCompression(u16),

    /// No tiled image found in the file
    #[error("Unsupported organization: file has no tiled image")]
    StripOrganization,
}

/// Errors raised by slide collaborators (open and region decode)
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// The slide could not be opened
    #[error("Cannot open slide {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: TiffError,
    },

    /// A region could not be decoded
    #[error("Cannot decode region at ({x}, {y}) {width}x{height}: {message}")]
    Decode {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        message: String,
    },

    /// Requested pyramid level does not exist
    #[error("Invalid level {level}: slide has {level_count} level(s)")]
    InvalidLevel { level: usize, level_count: usize },

    /// Container error while reading tile data
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),
}

/// Errors raised by the tiling pipelines
#[derive(Debug, Error)]
pub enum TilingError {
    /// Degenerate slide or chunk geometry
    #[error("Invalid dimensions: {width}x{height} with chunk {chunk_width}x{chunk_height}")]
    InvalidDimensions {
        width: u32,
        height: u32,
        chunk_width: u32,
        chunk_height: u32,
    },

    /// Slide open or decode error
    #[error(transparent)]
    Slide(#[from] SlideError),

    /// Image encoding failed
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// Filesystem error while writing outputs
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blocking worker panicked or was cancelled
    #[error("Worker failed: {message}")]
    Worker { message: String },
}

/// Errors raised by the batch driver before any slide is processed
#[derive(Debug, Error)]
pub enum BatchError {
    /// The input root does not exist or is not a directory
    #[error("Input folder not found: {0}")]
    InputNotFound(PathBuf),

    /// Filesystem error (output folder creation, discovery, report writing)
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TilingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TilingError::Io {
            path: path.into(),
            source,
        }
    }
}

impl BatchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BatchError::Io {
            path: path.into(),
            source,
        }
    }
}
