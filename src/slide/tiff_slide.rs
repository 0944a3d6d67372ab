//! Pyramidal TIFF / SVS slide reader.
//!
//! Tiled IFDs form the pyramid, largest first. Strip-organized IFDs (SVS
//! thumbnail, label and macro images) are ignored. Regions are assembled from
//! the tiles they intersect; decoded tiles are kept in a small per-handle LRU
//! cache because chunk grids and tile grids rarely line up.
//!
//! Opening a slide reads only the IFDs. Tile offsets and byte counts are
//! looked up one value at a time when a tile is first needed, so a short-lived
//! handle costs the same on a 40k-tile level as on a 4-tile one.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{SlideError, TiffError};
use crate::io::{LocalFileReader, RangeReader};

use super::jpeg::prepare_tile_jpeg;
use super::reader::{Slide, SlideOpener};
use super::tiff::{
    read_entry_bytes, read_entry_u64, read_entry_u64_at, read_entry_u64s, read_ifds, tag, Ifd,
    IfdEntry, TiffHeader, HEADER_PROBE_SIZE,
};

/// Default number of decoded tiles cached per slide handle.
pub const DEFAULT_TILE_CACHE_TILES: usize = 64;

const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_JPEG: u16 = 7;
const PHOTOMETRIC_MIN_IS_WHITE: u16 = 0;

// =============================================================================
// Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileCodec {
    Raw { samples: u16, min_is_white: bool },
    Jpeg,
}

#[derive(Debug, Clone)]
struct TiffLevel {
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    tiles_across: u32,
    codec: TileCodec,
    tile_offsets: IfdEntry,
    tile_byte_counts: IfdEntry,
    jpeg_tables: Option<Bytes>,
}

impl TiffLevel {
    /// Parse a tiled IFD. Returns `Ok(None)` for strip-organized images.
    async fn from_ifd<R: RangeReader>(
        reader: &R,
        header: &TiffHeader,
        ifd: &Ifd,
    ) -> Result<Option<Self>, TiffError> {
        let (Some(tile_width), Some(tile_height)) =
            (ifd.get(tag::TILE_WIDTH), ifd.get(tag::TILE_LENGTH))
        else {
            return Ok(None);
        };

        let required = |t: u16, name: &'static str| ifd.get(t).ok_or(TiffError::MissingTag(name));

        let width = read_u32(reader, header, required(tag::IMAGE_WIDTH, "ImageWidth")?).await?;
        let height = read_u32(reader, header, required(tag::IMAGE_LENGTH, "ImageLength")?).await?;
        let tile_width = read_u32(reader, header, tile_width).await?;
        let tile_height = read_u32(reader, header, tile_height).await?;

        if width == 0 || height == 0 || tile_width == 0 || tile_height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: "ImageWidth",
                message: format!("zero dimension in {}x{} / tile {}x{}", width, height, tile_width, tile_height),
            });
        }

        let compression = match ifd.get(tag::COMPRESSION) {
            Some(entry) => read_entry_u64(reader, header, entry).await? as u16,
            None => COMPRESSION_NONE,
        };
        let samples = match ifd.get(tag::SAMPLES_PER_PIXEL) {
            Some(entry) => read_entry_u64(reader, header, entry).await? as u16,
            None => 1,
        };
        if let Some(entry) = ifd.get(tag::BITS_PER_SAMPLE) {
            let bits = read_entry_u64s(reader, header, entry).await?;
            if bits.iter().any(|&b| b != 8) {
                return Err(TiffError::InvalidTagValue {
                    tag: "BitsPerSample",
                    message: format!("only 8-bit samples are supported, got {:?}", bits),
                });
            }
        }
        if let Some(entry) = ifd.get(tag::PLANAR_CONFIGURATION) {
            let planar = read_entry_u64(reader, header, entry).await?;
            if planar != 1 && samples > 1 {
                return Err(TiffError::InvalidTagValue {
                    tag: "PlanarConfiguration",
                    message: "only chunky (interleaved) samples are supported".to_string(),
                });
            }
        }

        let codec = match compression {
            COMPRESSION_NONE => {
                if !matches!(samples, 1 | 3 | 4) {
                    return Err(TiffError::InvalidTagValue {
                        tag: "SamplesPerPixel",
                        message: format!("unsupported sample count {}", samples),
                    });
                }
                let photometric = match ifd.get(tag::PHOTOMETRIC) {
                    Some(entry) => read_entry_u64(reader, header, entry).await? as u16,
                    None => 1,
                };
                TileCodec::Raw {
                    samples,
                    min_is_white: photometric == PHOTOMETRIC_MIN_IS_WHITE,
                }
            }
            COMPRESSION_JPEG => TileCodec::Jpeg,
            other => return Err(TiffError::UnsupportedCompression(other)),
        };

        let tile_offsets = required(tag::TILE_OFFSETS, "TileOffsets")?.clone();
        let tile_byte_counts = required(tag::TILE_BYTE_COUNTS, "TileByteCounts")?.clone();

        let tiles_across = width.div_ceil(tile_width);
        let tiles_down = height.div_ceil(tile_height);
        let expected = u64::from(tiles_across) * u64::from(tiles_down);
        if tile_offsets.count < expected || tile_byte_counts.count < expected {
            return Err(TiffError::InvalidTagValue {
                tag: "TileOffsets",
                message: format!(
                    "expected {} tiles, found {} offsets and {} byte counts",
                    expected, tile_offsets.count, tile_byte_counts.count
                ),
            });
        }

        let jpeg_tables = match ifd.get(tag::JPEG_TABLES) {
            Some(entry) => Some(read_entry_bytes(reader, header, entry).await?),
            None => None,
        };

        Ok(Some(Self {
            width,
            height,
            tile_width,
            tile_height,
            tiles_across,
            codec,
            tile_offsets,
            tile_byte_counts,
            jpeg_tables,
        }))
    }

    fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    /// Decode raw tile bytes into a full-size tile buffer.
    fn decode_tile(&self, data: &[u8]) -> Result<RgbImage, String> {
        let tile = match self.codec {
            TileCodec::Jpeg => {
                let stream = prepare_tile_jpeg(self.jpeg_tables.as_deref(), data);
                image::load_from_memory_with_format(&stream, ImageFormat::Jpeg)
                    .map_err(|e| e.to_string())?
                    .to_rgb8()
            }
            TileCodec::Raw {
                samples,
                min_is_white,
            } => {
                let samples = usize::from(samples);
                let pixels = self.tile_width as usize * self.tile_height as usize;
                if data.len() < pixels * samples {
                    return Err(format!(
                        "tile holds {} bytes, expected {}",
                        data.len(),
                        pixels * samples
                    ));
                }
                let mut rgb = Vec::with_capacity(pixels * 3);
                for px in data.chunks_exact(samples).take(pixels) {
                    match samples {
                        1 => {
                            let v = if min_is_white { 255 - px[0] } else { px[0] };
                            rgb.extend_from_slice(&[v, v, v]);
                        }
                        _ => rgb.extend_from_slice(&px[..3]),
                    }
                }
                RgbImage::from_raw(self.tile_width, self.tile_height, rgb)
                    .ok_or_else(|| "tile buffer size mismatch".to_string())?
            }
        };

        Ok(tile)
    }
}

async fn read_u32<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    entry: &super::tiff::IfdEntry,
) -> Result<u32, TiffError> {
    let value = read_entry_u64(reader, header, entry).await?;
    u32::try_from(value).map_err(|_| TiffError::InvalidTagValue {
        tag: "Dimension",
        message: format!("value {} exceeds u32", value),
    })
}

// =============================================================================
// TiffSlide
// =============================================================================

type TileKey = (usize, u32, u32);

/// A pyramidal TIFF slide read through a [`RangeReader`].
pub struct TiffSlide<R: RangeReader> {
    reader: R,
    header: TiffHeader,
    levels: Vec<TiffLevel>,
    tile_cache: Mutex<LruCache<TileKey, Option<Arc<RgbImage>>>>,
}

impl<R: RangeReader> TiffSlide<R> {
    /// Parse the container and collect its pyramid levels.
    pub async fn open(reader: R, cache_tiles: usize) -> Result<Self, TiffError> {
        let probe_len = HEADER_PROBE_SIZE.min(reader.size() as usize);
        let probe = reader.read_exact_at(0, probe_len).await?;
        let header = TiffHeader::parse(&probe, reader.size())?;

        let ifds = read_ifds(&reader, &header).await?;
        let mut levels = Vec::new();
        let mut first_error = None;
        for (index, ifd) in ifds.iter().enumerate() {
            match TiffLevel::from_ifd(&reader, &header, ifd).await {
                Ok(Some(level)) => levels.push(level),
                Ok(None) => debug!("{}: IFD {} is not tiled, skipping", reader.identifier(), index),
                Err(e) => {
                    debug!("{}: IFD {} unusable: {}", reader.identifier(), index, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if levels.is_empty() {
            return Err(first_error.unwrap_or(TiffError::StripOrganization));
        }
        levels.sort_by(|a, b| b.width.cmp(&a.width).then(b.height.cmp(&a.height)));

        let capacity = NonZeroUsize::new(cache_tiles.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            reader,
            header,
            levels,
            tile_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Tile size of a level.
    pub fn tile_size(&self, level: usize) -> Option<(u32, u32)> {
        self.levels
            .get(level)
            .map(|l| (l.tile_width, l.tile_height))
    }

    /// File offset and byte count of one tile.
    async fn tile_location(&self, level: &TiffLevel, index: u64) -> Result<(u64, u64), TiffError> {
        let offset =
            read_entry_u64_at(&self.reader, &self.header, &level.tile_offsets, index).await?;
        let length =
            read_entry_u64_at(&self.reader, &self.header, &level.tile_byte_counts, index).await?;
        Ok((offset, length))
    }

    /// Fetch a decoded tile, `None` for sparse (zero-length) tiles.
    async fn tile(
        &self,
        level_index: usize,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<Option<Arc<RgbImage>>, String> {
        let key = (level_index, tile_x, tile_y);
        if let Some(cached) = self.tile_cache.lock().await.get(&key) {
            return Ok(cached.clone());
        }

        let level = &self.levels[level_index];
        let index = u64::from(tile_y) * u64::from(level.tiles_across) + u64::from(tile_x);
        let (offset, length) = self
            .tile_location(level, index)
            .await
            .map_err(|e| e.to_string())?;

        let tile = if length == 0 {
            None
        } else {
            let length = usize::try_from(length)
                .map_err(|_| format!("tile {} claims {} bytes", index, length))?;
            let data = self
                .reader
                .read_exact_at(offset, length)
                .await
                .map_err(|e| e.to_string())?;
            Some(Arc::new(level.decode_tile(&data)?))
        };

        self.tile_cache.lock().await.put(key, tile.clone());
        Ok(tile)
    }
}

#[async_trait]
impl<R: RangeReader + 'static> Slide for TiffSlide<R> {
    fn identifier(&self) -> &str {
        self.reader.identifier()
    }

    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.get(level).map(|l| (l.width, l.height))
    }

    async fn read_region(
        &self,
        x: u32,
        y: u32,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, SlideError> {
        let downsample = self
            .level_downsample(level)
            .ok_or(SlideError::InvalidLevel {
                level,
                level_count: self.levels.len(),
            })?;
        let info = &self.levels[level];

        // Region bounds in level pixels, clipped to the level
        let left = (f64::from(x) / downsample).floor() as u64;
        let top = (f64::from(y) / downsample).floor() as u64;
        let right = (left + u64::from(width)).min(u64::from(info.width));
        let bottom = (top + u64::from(height)).min(u64::from(info.height));
        if left >= right || top >= bottom {
            return Ok(RgbImage::new(width, height));
        }

        let mut buf = vec![0u8; width as usize * height as usize * 3];

        let tile_w = u64::from(info.tile_width);
        let tile_h = u64::from(info.tile_height);
        let first_tx = (left / tile_w) as u32;
        let last_tx = ((right - 1) / tile_w) as u32;
        let first_ty = (top / tile_h) as u32;
        let last_ty = (((bottom - 1) / tile_h) as u32).min(info.tiles_down() - 1);

        for ty in first_ty..=last_ty {
            for tx in first_tx..=last_tx {
                let tile = self
                    .tile(level, tx, ty)
                    .await
                    .map_err(|message| SlideError::Decode {
                        x,
                        y,
                        width,
                        height,
                        message,
                    })?;
                let Some(tile) = tile else { continue };

                // Intersection of this tile with the region, in level pixels
                let tile_left = u64::from(tx) * tile_w;
                let tile_top = u64::from(ty) * tile_h;
                let x0 = left.max(tile_left);
                let x1 = right.min(tile_left + u64::from(tile.width()));
                let y0 = top.max(tile_top);
                let y1 = bottom.min(tile_top + u64::from(tile.height()));
                if x0 >= x1 || y0 >= y1 {
                    continue;
                }

                let span = ((x1 - x0) * 3) as usize;
                for row in y0..y1 {
                    let src = (((row - tile_top) * u64::from(tile.width()) + (x0 - tile_left)) * 3) as usize;
                    let dst = (((row - top) * u64::from(width) + (x0 - left)) * 3) as usize;
                    buf[dst..dst + span].copy_from_slice(&tile.as_raw()[src..src + span]);
                }
            }
        }

        RgbImage::from_raw(width, height, buf).ok_or_else(|| SlideError::Decode {
            x,
            y,
            width,
            height,
            message: "region buffer size mismatch".to_string(),
        })
    }
}

// =============================================================================
// Opener
// =============================================================================

/// Opens local pyramidal TIFF / SVS files.
#[derive(Debug, Clone)]
pub struct TiffSlideOpener {
    cache_tiles: usize,
}

impl TiffSlideOpener {
    pub fn new() -> Self {
        Self::with_tile_cache(DEFAULT_TILE_CACHE_TILES)
    }

    /// Opener whose handles cache up to `cache_tiles` decoded tiles each.
    pub fn with_tile_cache(cache_tiles: usize) -> Self {
        Self { cache_tiles }
    }
}

impl Default for TiffSlideOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlideOpener for TiffSlideOpener {
    async fn open(&self, path: &Path) -> Result<Box<dyn Slide>, SlideError> {
        let open_error = |source: TiffError| SlideError::Open {
            path: path.to_path_buf(),
            source,
        };

        let reader = LocalFileReader::open(path)
            .await
            .map_err(|e| open_error(TiffError::Io(e)))?;
        let slide = TiffSlide::open(reader, self.cache_tiles)
            .await
            .map_err(open_error)?;

        Ok(Box::new(slide))
    }
}

// =============================================================================
// Tests
// =============================================================================
