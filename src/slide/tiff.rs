//! Minimal TIFF / BigTIFF container parsing for tiled pyramids.
//!
//! Only what region decoding needs is parsed: the header, the IFD chain, and
//! the handful of tags describing tiled image data. Everything else in the
//! file (descriptions, resolutions, label and macro strips) is skipped.
//!
//! ```text
//! Classic: II|MM  42  u32 first-IFD           entries: 12 bytes, u16 count
//! BigTIFF: II|MM  43  8  0  u64 first-IFD     entries: 20 bytes, u64 count
//! ```

use std::collections::HashSet;

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::{read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le};
use crate::io::RangeReader;

/// Bytes read up-front to parse either header flavour.
pub const HEADER_PROBE_SIZE: usize = 16;

/// Safety limit on the IFD chain length.
const MAX_IFDS: usize = 256;

// =============================================================================
// Tags
// =============================================================================

pub mod tag {
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const BITS_PER_SAMPLE: u16 = 258;
    pub const COMPRESSION: u16 = 259;
    pub const PHOTOMETRIC: u16 = 262;
    pub const SAMPLES_PER_PIXEL: u16 = 277;
    pub const PLANAR_CONFIGURATION: u16 = 284;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const JPEG_TABLES: u16 = 347;
}

/// Size in bytes of one value of a TIFF field type, `None` if unknown.
fn field_type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 | 13 => Some(4),
        5 | 10 | 12 | 16 | 17 | 18 => Some(8),
        _ => None,
    }
}

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => read_u64_le(bytes),
            ByteOrder::BigEndian => read_u64_be(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    pub byte_order: ByteOrder,
    pub is_bigtiff: bool,
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a classic or BigTIFF header.
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < 8 {
            return Err(TiffError::FileTooSmall {
                required: 8,
                actual: bytes.len() as u64,
            });
        }

        let byte_order = match [bytes[0], bytes[1]] {
            [0x49, 0x49] => ByteOrder::LittleEndian,
            [0x4D, 0x4D] => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(u16::from_le_bytes([bytes[0], bytes[1]]))),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        let (is_bigtiff, first_ifd_offset) = match version {
            42 => (false, u64::from(byte_order.read_u32(&bytes[4..8]))),
            43 => {
                if bytes.len() < 16 {
                    return Err(TiffError::FileTooSmall {
                        required: 16,
                        actual: bytes.len() as u64,
                    });
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidTagValue {
                        tag: "BigTIFF offset size",
                        message: format!("expected 8, got {}", offset_size),
                    });
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            other => return Err(TiffError::InvalidVersion(other)),
        };

        if first_ifd_offset == 0 || first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(Self {
            byte_order,
            is_bigtiff,
            first_ifd_offset,
        })
    }

    fn entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    fn count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    fn offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }

    fn read_offset(&self, bytes: &[u8]) -> u64 {
        if self.is_bigtiff {
            self.byte_order.read_u64(bytes)
        } else {
            u64::from(self.byte_order.read_u32(bytes))
        }
    }
}

// =============================================================================
// IFD
// =============================================================================

/// One directory entry; `value` holds the raw inline value/offset field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u64,
    value: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Ifd {
    pub entries: Vec<IfdEntry>,
    pub next_offset: u64,
}

impl Ifd {
    pub fn get(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag == tag)
    }
}

/// Read the full IFD chain starting at the header's first offset.
pub async fn read_ifds<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
) -> Result<Vec<Ifd>, TiffError> {
    let mut ifds = Vec::new();
    let mut seen = HashSet::new();
    let mut offset = header.first_ifd_offset;

    while offset != 0 && ifds.len() < MAX_IFDS {
        if !seen.insert(offset) || offset >= reader.size() {
            return Err(TiffError::InvalidIfdOffset(offset));
        }
        let ifd = read_ifd(reader, header, offset).await?;
        offset = ifd.next_offset;
        ifds.push(ifd);
    }

    Ok(ifds)
}

async fn read_ifd<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    offset: u64,
) -> Result<Ifd, TiffError> {
    let count_bytes = reader.read_exact_at(offset, header.count_size()).await?;
    let count = if header.is_bigtiff {
        header.byte_order.read_u64(&count_bytes)
    } else {
        u64::from(header.byte_order.read_u16(&count_bytes))
    };

    let entries_len = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(header.entry_size()))
        .and_then(|n| n.checked_add(header.offset_size()))
        .ok_or_else(|| TiffError::InvalidTagValue {
            tag: "IFD entry count",
            message: format!("{} entries at offset {}", count, offset),
        })?;
    let body = reader
        .read_exact_at(offset + header.count_size() as u64, entries_len)
        .await?;

    let byte_order = header.byte_order;
    let entries = body
        .chunks_exact(header.entry_size())
        .take(count as usize)
        .map(|raw| {
            let (count, value) = if header.is_bigtiff {
                (byte_order.read_u64(&raw[4..12]), raw[12..20].to_vec())
            } else {
                (u64::from(byte_order.read_u32(&raw[4..8])), raw[8..12].to_vec())
            };
            IfdEntry {
                tag: byte_order.read_u16(&raw[0..2]),
                field_type: byte_order.read_u16(&raw[2..4]),
                count,
                value,
            }
        })
        .collect();

    let next_offset = header.read_offset(&body[entries_len - header.offset_size()..]);

    Ok(Ifd {
        entries,
        next_offset,
    })
}

// =============================================================================
// Value Reading
// =============================================================================

/// Raw bytes of an entry's value, inline or out-of-line.
pub async fn read_entry_bytes<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<Bytes, TiffError> {
    let size = entry_type_size(entry)?;
    let total = usize::try_from(entry.count)
        .ok()
        .and_then(|n| n.checked_mul(size))
        .ok_or_else(|| TiffError::InvalidTagValue {
            tag: "Count",
            message: format!("tag {} has {} values", entry.tag, entry.count),
        })?;

    if total <= entry.value.len() {
        return Ok(Bytes::copy_from_slice(&entry.value[..total]));
    }

    let offset = header.read_offset(&entry.value);
    Ok(reader.read_exact_at(offset, total).await?)
}

fn entry_type_size(entry: &IfdEntry) -> Result<usize, TiffError> {
    field_type_size(entry.field_type).ok_or_else(|| TiffError::InvalidTagValue {
        tag: "FieldType",
        message: format!("unknown field type {} on tag {}", entry.field_type, entry.tag),
    })
}

/// Decode one unsigned integer of `entry`'s type from `raw`.
fn decode_uint(order: ByteOrder, entry: &IfdEntry, raw: &[u8]) -> Result<u64, TiffError> {
    match entry.field_type {
        1 | 7 => Ok(u64::from(raw[0])),
        3 => Ok(u64::from(order.read_u16(raw))),
        4 | 13 => Ok(u64::from(order.read_u32(raw))),
        16 | 18 => Ok(order.read_u64(raw)),
        other => Err(TiffError::InvalidTagValue {
            tag: "FieldType",
            message: format!("expected an unsigned integer type on tag {}, got {}", entry.tag, other),
        }),
    }
}

/// Integer values of an entry (BYTE, SHORT, LONG or LONG8).
pub async fn read_entry_u64s<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<Vec<u64>, TiffError> {
    let size = entry_type_size(entry)?;
    let bytes = read_entry_bytes(reader, header, entry).await?;
    bytes
        .chunks_exact(size)
        .map(|raw| decode_uint(header.byte_order, entry, raw))
        .collect()
}

/// The `index`-th integer value of an entry, reading only that value.
///
/// Used for tile offset and byte count arrays, which can hold hundreds of
/// thousands of values on large slides.
pub async fn read_entry_u64_at<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
    index: u64,
) -> Result<u64, TiffError> {
    if index >= entry.count {
        return Err(TiffError::InvalidTagValue {
            tag: "Count",
            message: format!("index {} out of {} values on tag {}", index, entry.count, entry.tag),
        });
    }
    let size = entry_type_size(entry)?;
    // index < count, so this only overflows if the whole array would
    let start = usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(size))
        .ok_or_else(|| TiffError::InvalidTagValue {
            tag: "Count",
            message: format!("tag {} has {} values", entry.tag, entry.count),
        })?;

    let inline = usize::try_from(entry.count)
        .ok()
        .and_then(|n| n.checked_mul(size))
        .is_some_and(|total| total <= entry.value.len());
    if inline {
        return decode_uint(header.byte_order, entry, &entry.value[start..start + size]);
    }

    let offset = header
        .read_offset(&entry.value)
        .checked_add(start as u64)
        .ok_or(TiffError::InvalidIfdOffset(u64::MAX))?;
    let raw = reader.read_exact_at(offset, size).await?;
    decode_uint(header.byte_order, entry, &raw)
}

/// First integer value of an entry.
pub async fn read_entry_u64<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<u64, TiffError> {
    read_entry_u64s(reader, header, entry)
        .await?
        .first()
        .copied()
        .ok_or(TiffError::InvalidTagValue {
            tag: "Count",
            message: format!("tag {} has no values", entry.tag),
        })
}

// =============================================================================
// Tests
// =============================================================================
