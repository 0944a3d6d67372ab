//! Abbreviated JPEG stream handling.
//!
//! Aperio SVS tiles are stored as abbreviated JPEG streams: each tile starts
//! with SOI and goes straight to its scan without the quantization (DQT) and
//! Huffman (DHT) tables. The tables live once per level in the `JPEGTables`
//! tag and are spliced in front of the tile data before decoding:
//!
//! ```text
//! tables:  SOI DQT DHT ... EOI
//! tile:    SOI SOF SOS <scan> EOI
//! merged:  SOI DQT DHT ... SOF SOS <scan> EOI
//! ```

use bytes::{Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

const MARKER_DHT: u8 = 0xC4;
const MARKER_DQT: u8 = 0xDB;
const MARKER_SOS: u8 = 0xDA;

/// Whether a stream reaches its first scan without defining any tables.
pub fn is_abbreviated_stream(data: &[u8]) -> bool {
    if data.len() < 4 || data[..2] != SOI {
        return false;
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }

        match data[pos + 1] {
            MARKER_DQT | MARKER_DHT => return false,
            MARKER_SOS => return true,
            // Fill bytes and standalone markers carry no length field
            0xFF | 0x00 | 0x01 | 0xD0..=0xD9 => pos += 2,
            _ => {
                if pos + 3 >= data.len() {
                    return false;
                }
                let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
                pos += 2 + length;
            }
        }
    }

    false
}

/// Splice `tables` (SOI ... EOI) in front of `tile` (SOI ... EOI).
pub fn merge_jpeg_tables(tables: &[u8], tile: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile);
    }

    let tables = tables.strip_suffix(&EOI).unwrap_or(tables);
    let tile = tile.strip_prefix(&SOI).unwrap_or(tile);

    let mut merged = BytesMut::with_capacity(tables.len() + tile.len());
    merged.extend_from_slice(tables);
    merged.extend_from_slice(tile);
    merged.freeze()
}

/// Produce a self-contained JPEG stream for a tile.
///
/// Tables are merged only when the tile is abbreviated; complete streams are
/// returned unchanged.
pub fn prepare_tile_jpeg(tables: Option<&[u8]>, tile: &[u8]) -> Bytes {
    match tables {
        Some(tables) if is_abbreviated_stream(tile) => merge_jpeg_tables(tables, tile),
        _ => Bytes::copy_from_slice(tile),
    }
}
