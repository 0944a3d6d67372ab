//! Test utilities for integration tests.
//!
//! Provides synthetic in-memory slides (with per-region decode failures and
//! open counting) and a writer for small pyramidal TIFF files that the bundled
//! slide reader can open from disk.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wsi_tiler::error::{IoError, SlideError, TiffError};
use wsi_tiler::slide::{Slide, SlideOpener};

/// Pixel colour as a function of level-0 coordinates.
pub type PixelFn = Arc<dyn Fn(u32, u32) -> [u8; 3] + Send + Sync>;

/// Tissue-like pink used for synthetic stained areas.
pub const TISSUE: [u8; 3] = [190, 110, 160];

/// Bright glass background.
pub const GLASS: [u8; 3] = [245, 245, 245];

// =============================================================================
// In-memory Slides
// =============================================================================

/// Tracks how many region decodes are running at once.
#[derive(Debug, Default)]
pub struct DecodeGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl DecodeGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of overlapping decodes seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A procedurally generated single-level slide.
#[derive(Clone)]
pub struct PatternSlide {
    width: u32,
    height: u32,
    pixel: PixelFn,
    failing: HashSet<(u32, u32)>,
    gauge: Option<(Arc<DecodeGauge>, Duration)>,
}

impl PatternSlide {
    pub fn new(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 3] + Send + Sync + 'static) -> Self {
        Self {
            width,
            height,
            pixel: Arc::new(pixel),
            failing: HashSet::new(),
            gauge: None,
        }
    }

    /// Uniform colour slide.
    pub fn uniform(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(width, height, move |_, _| rgb)
    }

    /// Make regions whose top-left corner is `(x, y)` fail to decode.
    pub fn failing_at(mut self, x: u32, y: u32) -> Self {
        self.failing.insert((x, y));
        self
    }

    /// Make every decode take `delay` and report itself to `gauge`.
    pub fn slow(mut self, gauge: Arc<DecodeGauge>, delay: Duration) -> Self {
        self.gauge = Some((gauge, delay));
        self
    }
}

#[async_trait]
impl Slide for PatternSlide {
    fn identifier(&self) -> &str {
        "mem://pattern"
    }

    fn level_count(&self) -> usize {
        1
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        (level == 0).then_some((self.width, self.height))
    }

    async fn read_region(
        &self,
        x: u32,
        y: u32,
        _level: usize,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, SlideError> {
        if let Some((gauge, delay)) = &self.gauge {
            gauge.enter();
            tokio::time::sleep(*delay).await;
            gauge.exit();
        }

        if self.failing.contains(&(x, y)) {
            return Err(SlideError::Decode {
                x,
                y,
                width,
                height,
                message: "synthetic decode failure".to_string(),
            });
        }

        Ok(RgbImage::from_fn(width, height, |px, py| {
            let (gx, gy) = (x + px, y + py);
            if gx < self.width && gy < self.height {
                Rgb((self.pixel)(gx, gy))
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }
}

/// Opens [`PatternSlide`]s registered by path and counts every open.
#[derive(Default)]
pub struct PatternOpener {
    slides: HashMap<PathBuf, PatternSlide>,
    opens: AtomicUsize,
}

impl PatternOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slide(mut self, path: impl Into<PathBuf>, slide: PatternSlide) -> Self {
        self.slides.insert(path.into(), slide);
        self
    }

    /// Number of handles opened so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideOpener for PatternOpener {
    async fn open(&self, path: &Path) -> Result<Box<dyn Slide>, SlideError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.slides.get(path) {
            Some(slide) => Ok(Box::new(slide.clone())),
            None => Err(SlideError::Open {
                path: path.to_path_buf(),
                source: TiffError::Io(IoError::NotFound(path.display().to_string())),
            }),
        }
    }
}

// =============================================================================
// Pyramidal TIFF Writer
// =============================================================================

const IMAGE_WIDTH: u16 = 256;
const IMAGE_LENGTH: u16 = 257;
const COMPRESSION: u16 = 259;
const PHOTOMETRIC: u16 = 262;
const STRIP_OFFSETS: u16 = 273;
const SAMPLES_PER_PIXEL: u16 = 277;
const ROWS_PER_STRIP: u16 = 278;
const STRIP_BYTE_COUNTS: u16 = 279;
const TILE_WIDTH: u16 = 322;
const TILE_LENGTH: u16 = 323;
const TILE_OFFSETS: u16 = 324;
const TILE_BYTE_COUNTS: u16 = 325;

const SHORT: u16 = 3;
const LONG: u16 = 4;

/// One tiled pyramid level.
#[derive(Debug, Clone, Copy)]
pub struct LevelSpec {
    pub width: u32,
    pub height: u32,
    pub tile: u32,

    /// JPEG-compress tiles at this quality, uncompressed RGB when `None`
    pub jpeg_quality: Option<u8>,
}

impl LevelSpec {
    pub fn raw(width: u32, height: u32, tile: u32) -> Self {
        Self {
            width,
            height,
            tile,
            jpeg_quality: None,
        }
    }

    pub fn jpeg(width: u32, height: u32, tile: u32, quality: u8) -> Self {
        Self {
            jpeg_quality: Some(quality),
            ..Self::raw(width, height, tile)
        }
    }
}

/// Builds little-endian classic TIFF files with tiled levels and an optional
/// strip-organized thumbnail (like the one Aperio puts after level 0).
pub struct PyramidTiffBuilder {
    levels: Vec<LevelSpec>,
    thumbnail: Option<(u32, u32)>,
    pixel: PixelFn,
}

impl PyramidTiffBuilder {
    pub fn new(pixel: impl Fn(u32, u32) -> [u8; 3] + Send + Sync + 'static) -> Self {
        Self {
            levels: Vec::new(),
            thumbnail: None,
            pixel: Arc::new(pixel),
        }
    }

    pub fn level(mut self, level: LevelSpec) -> Self {
        self.levels.push(level);
        self
    }

    /// Insert a strip thumbnail IFD right after the first level (or alone).
    pub fn thumbnail(mut self, width: u32, height: u32) -> Self {
        self.thumbnail = Some((width, height));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = vec![0x49, 0x49, 0x2A, 0x00, 0, 0, 0, 0];
        let mut next_ptr_at = 4;
        let base_width = self
            .levels
            .first()
            .map(|l| l.width)
            .or(self.thumbnail.map(|(width, _)| width))
            .unwrap_or(1);

        if self.levels.is_empty() {
            if let Some((width, height)) = self.thumbnail {
                let entries = self.write_strip(&mut out, width, height, base_width);
                write_ifd(&mut out, &mut next_ptr_at, entries);
            }
        }

        for (index, level) in self.levels.iter().enumerate() {
            let entries = self.write_level(&mut out, level, base_width);
            write_ifd(&mut out, &mut next_ptr_at, entries);

            if index == 0 {
                if let Some((width, height)) = self.thumbnail {
                    let entries = self.write_strip(&mut out, width, height, base_width);
                    write_ifd(&mut out, &mut next_ptr_at, entries);
                }
            }
        }
        out
    }

    fn sample(&self, x: u32, y: u32, width: u32, height: u32, base_width: u32) -> [u8; 3] {
        if x >= width || y >= height {
            return [0, 0, 0];
        }
        let downsample = f64::from(base_width) / f64::from(width);
        (self.pixel)(
            (f64::from(x) * downsample) as u32,
            (f64::from(y) * downsample) as u32,
        )
    }

    fn write_level(&self, out: &mut Vec<u8>, level: &LevelSpec, base_width: u32) -> Vec<Entry> {
        let across = level.width.div_ceil(level.tile);
        let down = level.height.div_ceil(level.tile);

        let mut offsets = Vec::new();
        let mut counts = Vec::new();
        for ty in 0..down {
            for tx in 0..across {
                let tile = RgbImage::from_fn(level.tile, level.tile, |px, py| {
                    Rgb(self.sample(
                        tx * level.tile + px,
                        ty * level.tile + py,
                        level.width,
                        level.height,
                        base_width,
                    ))
                });
                let bytes = match level.jpeg_quality {
                    Some(quality) => encode_jpeg(&tile, quality),
                    None => tile.into_raw(),
                };
                offsets.push(out.len() as u32);
                counts.push(bytes.len() as u32);
                out.extend_from_slice(&bytes);
            }
        }

        let (compression, photometric) = match level.jpeg_quality {
            Some(_) => (7, 6),
            None => (1, 2),
        };
        vec![
            Entry::inline(IMAGE_WIDTH, LONG, level.width),
            Entry::inline(IMAGE_LENGTH, LONG, level.height),
            Entry::inline(COMPRESSION, SHORT, compression),
            Entry::inline(PHOTOMETRIC, SHORT, photometric),
            Entry::inline(SAMPLES_PER_PIXEL, SHORT, 3),
            Entry::inline(TILE_WIDTH, LONG, level.tile),
            Entry::inline(TILE_LENGTH, LONG, level.tile),
            Entry::array(out, TILE_OFFSETS, &offsets),
            Entry::array(out, TILE_BYTE_COUNTS, &counts),
        ]
    }

    fn write_strip(&self, out: &mut Vec<u8>, width: u32, height: u32, base_width: u32) -> Vec<Entry> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb(self.sample(x, y, width, height, base_width))
        });
        let offset = out.len() as u32;
        let bytes = image.into_raw();
        out.extend_from_slice(&bytes);

        vec![
            Entry::inline(IMAGE_WIDTH, LONG, width),
            Entry::inline(IMAGE_LENGTH, LONG, height),
            Entry::inline(COMPRESSION, SHORT, 1),
            Entry::inline(PHOTOMETRIC, SHORT, 2),
            Entry::inline(STRIP_OFFSETS, LONG, offset),
            Entry::inline(SAMPLES_PER_PIXEL, SHORT, 3),
            Entry::inline(ROWS_PER_STRIP, LONG, height),
            Entry::inline(STRIP_BYTE_COUNTS, LONG, bytes.len() as u32),
        ]
    }
}

struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    value: u32,
}

impl Entry {
    fn inline(tag: u16, field_type: u16, value: u32) -> Self {
        Self {
            tag,
            field_type,
            count: 1,
            value,
        }
    }

    /// LONG array entry; values are written to `out` unless they fit inline.
    fn array(out: &mut Vec<u8>, tag: u16, values: &[u32]) -> Self {
        if values.len() == 1 {
            return Self::inline(tag, LONG, values[0]);
        }
        if out.len() % 2 == 1 {
            out.push(0);
        }
        let at = out.len() as u32;
        for value in values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            tag,
            field_type: LONG,
            count: values.len() as u32,
            value: at,
        }
    }
}

fn write_ifd(out: &mut Vec<u8>, next_ptr_at: &mut usize, mut entries: Vec<Entry>) {
    if out.len() % 2 == 1 {
        out.push(0);
    }
    let at = out.len() as u32;
    out[*next_ptr_at..*next_ptr_at + 4].copy_from_slice(&at.to_le_bytes());

    entries.sort_by_key(|e| e.tag);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in &entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.field_type.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        out.extend_from_slice(&entry.value.to_le_bytes());
    }

    *next_ptr_at = out.len();
    out.extend_from_slice(&0u32.to_le_bytes());
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(image)
        .unwrap();
    buf
}

/// Write a single-level uncompressed slide to `path`.
pub fn write_slide(
    path: &Path,
    width: u32,
    height: u32,
    tile: u32,
    pixel: impl Fn(u32, u32) -> [u8; 3] + Send + Sync + 'static,
) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let data = PyramidTiffBuilder::new(pixel)
        .level(LevelSpec::raw(width, height, tile))
        .build();
    std::fs::write(path, data).unwrap();
}

// =============================================================================
// Helpers
// =============================================================================

/// Sorted file names inside `dir`.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Tissue on the left `split` columns, glass elsewhere.
pub fn tissue_left_of(split: u32) -> impl Fn(u32, u32) -> [u8; 3] + Send + Sync + 'static {
    move |x, _| if x < split { TISSUE } else { GLASS }
}
