//! Chunk grid partitioning.
//!
//! Splits a slide's level-0 pixel plane into a row-major grid of read regions.
//! Every region has the requested chunk size except those in the last column
//! and last row, which are truncated to the slide edge:
//!
//! ```text
//!   x = 0        cw        2cw     width
//!   ┌──────────┬──────────┬──────┐ y = 0
//!   │ (0,0)    │ (1,0)    │(2,0) │
//!   ├──────────┼──────────┼──────┤ ch
//!   │ (0,1)    │ (1,1)    │(2,1) │
//!   └──────────┴──────────┴──────┘ height
//! ```
//!
//! The rectangles are pairwise disjoint and their union is exactly
//! `[0, width) x [0, height)`.

use serde::Serialize;

use crate::error::TilingError;

// =============================================================================
// Geometry Types
// =============================================================================

/// Requested chunk dimensions in level-0 pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChunkSize {
    pub width: u32,
    pub height: u32,
}

impl ChunkSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Square chunk of `size x size` pixels.
    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

/// A rectangular read region in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChunkRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ChunkRect {
    /// Number of pixels covered by this rectangle.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Whether two rectangles share at least one pixel.
    pub fn intersects(&self, other: &ChunkRect) -> bool {
        let x_overlap = self.x < other.x + other.width && other.x < self.x + self.width;
        let y_overlap = self.y < other.y + other.height && other.y < self.y + self.height;
        x_overlap && y_overlap
    }
}

/// A grid rectangle together with the column/row index it was generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCell {
    /// Column index (0-indexed from left)
    pub col: u32,

    /// Row index (0-indexed from top)
    pub row: u32,

    pub rect: ChunkRect,
}

// =============================================================================
// ChunkGrid
// =============================================================================

/// The chunk grid covering one slide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    width: u32,
    height: u32,
    chunk: ChunkSize,
    columns: u32,
    rows: u32,
}

impl ChunkGrid {
    /// Partition a `width x height` plane into chunks of `chunk` size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimensions` if any dimension is zero.
    pub fn partition(width: u32, height: u32, chunk: ChunkSize) -> Result<Self, TilingError> {
        if width == 0 || height == 0 || chunk.width == 0 || chunk.height == 0 {
            return Err(TilingError::InvalidDimensions {
                width,
                height,
                chunk_width: chunk.width,
                chunk_height: chunk.height,
            });
        }

        Ok(Self {
            width,
            height,
            chunk,
            columns: width.div_ceil(chunk.width),
            rows: height.div_ceil(chunk.height),
        })
    }

    /// Slide dimensions this grid covers.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Requested (nominal) chunk size.
    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk
    }

    /// Number of chunk columns (`ceil(width / chunk_width)`).
    pub fn columns(&self) -> u32 {
        self.columns
    }

    /// Number of chunk rows (`ceil(height / chunk_height)`).
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Total number of chunks.
    pub fn len(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cell at a given column and row, with edge truncation applied.
    pub fn cell(&self, col: u32, row: u32) -> Option<GridCell> {
        if col >= self.columns || row >= self.rows {
            return None;
        }

        let x = col * self.chunk.width;
        let y = row * self.chunk.height;

        Some(GridCell {
            col,
            row,
            rect: ChunkRect {
                x,
                y,
                width: self.chunk.width.min(self.width - x),
                height: self.chunk.height.min(self.height - y),
            },
        })
    }

    /// Iterate cells in row-major order (y outer, x inner).
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        (0..self.rows).flat_map(move |row| {
            (0..self.columns).filter_map(move |col| self.cell(col, row))
        })
    }

    /// Iterate rectangles in row-major order.
    pub fn rects(&self) -> impl Iterator<Item = ChunkRect> + '_ {
        self.cells().map(|cell| cell.rect)
    }
}

// =============================================================================
// Tests
// =============================================================================
