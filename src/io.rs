use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{s, Array3, ArrayView3};
use tiff::decoder::{ChunkType, Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{ColorType, Gray8, RGB8, RGBA8};
use tiff::encoder::compression::{Deflate, Lzw, Uncompressed};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

use crate::config::Compression;
use crate::error::{KelpError, Result};
use crate::georef::GeoReference;
use crate::tiling::Window;

/// Read access to a georeferenced raster, one window at a time.
pub trait RasterSource {
    /// `(height, width)` in pixels.
    fn dimensions(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    fn georef(&self) -> &GeoReference;

    /// Read a window as a `(bands, height, width)` array of `f32` samples.
    fn read_window(&mut self, window: &Window) -> Result<Array3<f32>>;

    fn full_window(&self) -> Window {
        let (height, width) = self.dimensions();
        Window::new(0, 0, height, width)
    }
}

/// Opens independent handles onto the same raster, one per reader worker.
pub trait RasterOpener: Send + Sync {
    type Source: RasterSource;

    fn open(&self) -> Result<Self::Source>;
}

#[derive(Debug, Clone)]
pub struct RasterMetadata {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub samples: SampleKind,
    pub georef: GeoReference,
}

/// Storage type of a raster's samples, from `SampleFormat` and `BitsPerSample`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Unsigned(u16),
    Signed(u16),
    Float(u16),
}

impl SampleKind {
    fn read_from<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Self> {
        let bits = match decoder.find_tag(Tag::BitsPerSample)? {
            Some(value) => value.into_u16_vec()?.first().copied().unwrap_or(1),
            None => 1,
        };
        let format = match decoder.find_tag(Tag::SampleFormat)? {
            Some(value) => value.into_u16_vec()?.first().copied().unwrap_or(1),
            None => 1,
        };
        match format {
            1 => Ok(SampleKind::Unsigned(bits)),
            2 => Ok(SampleKind::Signed(bits)),
            3 => Ok(SampleKind::Float(bits)),
            other => Err(KelpError::UnsupportedRaster(format!(
                "sample format {} is not supported",
                other
            ))),
        }
    }

    /// Largest representable value for unsigned integer samples, used to scale
    /// them to `[0, 1]`. Signed and float samples have no fixed range.
    pub fn max_value(&self) -> Option<f32> {
        match *self {
            SampleKind::Unsigned(bits) if (1..=32).contains(&bits) => {
                Some(((1u64 << bits) - 1) as f32)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleKind::Unsigned(bits) => write!(f, "u{}", bits),
            SampleKind::Signed(bits) => write!(f, "i{}", bits),
            SampleKind::Float(bits) => write!(f, "f{}", bits),
        }
    }
}

/// Read the dimensions and georeferencing of a GeoTIFF without decoding pixels.
pub fn read_metadata(path: impl AsRef<Path>) -> Result<RasterMetadata> {
    let source = GeoTiffSource::open(path)?;
    let (height, width) = source.dimensions();
    Ok(RasterMetadata {
        width,
        height,
        bands: source.band_count(),
        samples: source.samples,
        georef: source.georef.clone(),
    })
}

/// Windowed GeoTIFF reader.
///
/// Only the strips or tiles intersecting a requested window are decoded.
pub struct GeoTiffSource {
    decoder: Decoder<BufReader<File>>,
    height: usize,
    width: usize,
    bands: usize,
    planar: bool,
    chunk_width: usize,
    chunk_height: usize,
    chunks_across: usize,
    chunks_per_band: usize,
    samples: SampleKind,
    georef: GeoReference,
}

impl GeoTiffSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening raster: {}", path.display());

        let file = File::open(&path)?;
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

        let (width, height) = decoder.dimensions()?;
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 {
            return Err(KelpError::InvalidGeometry(format!(
                "raster dimensions must be positive, got {}x{}",
                height, width
            )));
        }

        let bands = decoder
            .find_tag_unsigned::<u16>(Tag::SamplesPerPixel)?
            .unwrap_or(1) as usize;
        let planar = decoder
            .find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?
            .unwrap_or(1)
            == 2;

        let samples = SampleKind::read_from(&mut decoder)?;

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let (chunk_width, chunk_height) = (chunk_width as usize, chunk_height as usize);
        if chunk_width == 0 || chunk_height == 0 {
            return Err(KelpError::UnsupportedRaster(format!(
                "{} has zero-sized {:?} chunks",
                path.display(),
                decoder.get_chunk_type()
            )));
        }
        let chunks_across = (width + chunk_width - 1) / chunk_width;
        let chunks_down = (height + chunk_height - 1) / chunk_height;

        let georef = GeoReference::read_from(&mut decoder)?;

        debug!(
            "{}: {}x{} pixels, {} band(s) of {}, {:?} layout {}x{}, planar={}",
            path.display(),
            height,
            width,
            bands,
            samples,
            decoder.get_chunk_type(),
            chunk_height,
            chunk_width,
            planar
        );

        Ok(Self {
            decoder,
            height,
            width,
            bands,
            planar,
            chunk_width,
            chunk_height,
            chunks_across,
            chunks_per_band: chunks_across * chunks_down,
            samples,
            georef,
        })
    }

    pub fn sample_kind(&self) -> SampleKind {
        self.samples
    }

    pub fn is_tiled(&self) -> bool {
        self.decoder.get_chunk_type() == ChunkType::Tile
    }

    fn copy_chunk(
        &mut self,
        window: &Window,
        chunk_row: usize,
        chunk_col: usize,
        plane: usize,
        out: &mut Array3<f32>,
    ) -> Result<()> {
        let chunk_index = plane * self.chunks_per_band + chunk_row * self.chunks_across + chunk_col;
        let chunk_index = u32::try_from(chunk_index)
            .map_err(|_| KelpError::UnsupportedRaster(format!("chunk index {} too large", chunk_index)))?;

        let samples = decoding_to_f32(self.decoder.read_chunk(chunk_index)?);
        let (data_width, data_height) = self.decoder.chunk_data_dimensions(chunk_index);
        let (data_width, data_height) = (data_width as usize, data_height as usize);
        let samples_per_pixel = if self.planar { 1 } else { self.bands };

        if samples.len() < data_width * data_height * samples_per_pixel {
            return Err(KelpError::UnsupportedRaster(format!(
                "chunk {} decoded {} samples, expected {}",
                chunk_index,
                samples.len(),
                data_width * data_height * samples_per_pixel
            )));
        }

        let chunk_top = chunk_row * self.chunk_height;
        let chunk_left = chunk_col * self.chunk_width;
        let row_start = window.row.max(chunk_top);
        let row_end = window.row_end().min(chunk_top + data_height);
        let col_start = window.col.max(chunk_left);
        let col_end = window.col_end().min(chunk_left + data_width);

        for r in row_start..row_end {
            for c in col_start..col_end {
                let base = ((r - chunk_top) * data_width + (c - chunk_left)) * samples_per_pixel;
                let (out_r, out_c) = (r - window.row, c - window.col);
                if self.planar {
                    out[[plane, out_r, out_c]] = samples[base];
                } else {
                    for band in 0..self.bands {
                        out[[band, out_r, out_c]] = samples[base + band];
                    }
                }
            }
        }

        Ok(())
    }
}

impl RasterSource for GeoTiffSource {
    fn dimensions(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    fn band_count(&self) -> usize {
        self.bands
    }

    fn georef(&self) -> &GeoReference {
        &self.georef
    }

    fn read_window(&mut self, window: &Window) -> Result<Array3<f32>> {
        if window.area() == 0 || !window.fits_within(self.height, self.width) {
            return Err(KelpError::read(
                *window,
                KelpError::InvalidGeometry(format!(
                    "window outside {}x{} raster",
                    self.height, self.width
                )),
            ));
        }

        let mut out = Array3::<f32>::zeros((self.bands, window.height, window.width));
        let first_row = window.row / self.chunk_height;
        let last_row = (window.row_end() - 1) / self.chunk_height;
        let first_col = window.col / self.chunk_width;
        let last_col = (window.col_end() - 1) / self.chunk_width;
        let planes = if self.planar { self.bands } else { 1 };

        for chunk_row in first_row..=last_row {
            for chunk_col in first_col..=last_col {
                for plane in 0..planes {
                    self.copy_chunk(window, chunk_row, chunk_col, plane, &mut out)
                        .map_err(|e| KelpError::read(*window, e))?;
                }
            }
        }

        Ok(out)
    }
}

/// Opens a fresh [`GeoTiffSource`] for each caller.
#[derive(Debug, Clone)]
pub struct GeoTiffFile {
    path: PathBuf,
}

impl GeoTiffFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RasterOpener for GeoTiffFile {
    type Source = GeoTiffSource;

    fn open(&self) -> Result<GeoTiffSource> {
        GeoTiffSource::open(&self.path)
    }
}

/// A raster held in memory; clones share the pixel buffer.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    data: Arc<Array3<f32>>,
    georef: GeoReference,
}

impl MemoryRaster {
    pub fn new(data: Array3<f32>, georef: GeoReference) -> Self {
        Self {
            data: Arc::new(data),
            georef,
        }
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }
}

impl RasterSource for MemoryRaster {
    fn dimensions(&self) -> (usize, usize) {
        let (_, height, width) = self.data.dim();
        (height, width)
    }

    fn band_count(&self) -> usize {
        self.data.dim().0
    }

    fn georef(&self) -> &GeoReference {
        &self.georef
    }

    fn read_window(&mut self, window: &Window) -> Result<Array3<f32>> {
        let (height, width) = self.dimensions();
        if window.area() == 0 || !window.fits_within(height, width) {
            return Err(KelpError::read(
                *window,
                KelpError::InvalidGeometry(format!("window outside {}x{} raster", height, width)),
            ));
        }
        Ok(self
            .data
            .slice(s![.., window.row..window.row_end(), window.col..window.col_end()])
            .to_owned())
    }
}

impl RasterOpener for MemoryRaster {
    type Source = MemoryRaster;

    fn open(&self) -> Result<MemoryRaster> {
        Ok(self.clone())
    }
}

fn decoding_to_f32(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
    }
}

/// Write a `(bands, height, width)` 8-bit raster as a GeoTIFF.
///
/// One, three and four band rasters are supported (gray, RGB, RGBA).
pub fn write_raster_u8(
    path: impl AsRef<Path>,
    data: ArrayView3<u8>,
    georef: &GeoReference,
    compression: Compression,
) -> Result<()> {
    let path = path.as_ref();
    let (bands, height, width) = data.dim();
    info!(
        "Writing {} band raster {}x{}: {}",
        bands,
        height,
        width,
        path.display()
    );

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    if bands == 1 {
        let plane = data.index_axis(ndarray::Axis(0), 0);
        match plane.as_slice() {
            Some(samples) => encode_image::<Gray8, _>(&mut writer, width, height, samples, georef, compression)?,
            None => {
                let samples: Vec<u8> = plane.iter().copied().collect();
                encode_image::<Gray8, _>(&mut writer, width, height, &samples, georef, compression)?
            }
        }
    } else {
        // Interleave planes into chunky pixel order
        let samples: Vec<u8> = data.permuted_axes([1, 2, 0]).iter().copied().collect();
        match bands {
            3 => encode_image::<RGB8, _>(&mut writer, width, height, &samples, georef, compression)?,
            4 => encode_image::<RGBA8, _>(&mut writer, width, height, &samples, georef, compression)?,
            n => {
                return Err(KelpError::UnsupportedRaster(format!(
                    "cannot encode {} band 8-bit raster",
                    n
                )))
            }
        }
    }

    writer.flush()?;
    Ok(())
}

/// Encode a single-band 8-bit label image from a row-major slice.
pub fn write_labels<W: Write + Seek>(
    writer: &mut W,
    height: usize,
    width: usize,
    labels: &[u8],
    georef: &GeoReference,
    compression: Compression,
) -> Result<()> {
    encode_image::<Gray8, _>(writer, width, height, labels, georef, compression)
}

fn encode_image<C, W>(
    writer: &mut W,
    width: usize,
    height: usize,
    samples: &[u8],
    georef: &GeoReference,
    compression: Compression,
) -> Result<()>
where
    C: ColorType<Inner = u8>,
    W: Write + Seek,
{
    let width = u32::try_from(width)
        .map_err(|_| KelpError::UnsupportedRaster(format!("width {} exceeds TIFF limits", width)))?;
    let height = u32::try_from(height)
        .map_err(|_| KelpError::UnsupportedRaster(format!("height {} exceeds TIFF limits", height)))?;

    let mut encoder = TiffEncoder::new(writer)?;
    match compression {
        Compression::None => {
            let mut image = encoder.new_image_with_compression::<C, _>(width, height, Uncompressed)?;
            georef.write_to(image.encoder())?;
            image.write_data(samples)?;
        }
        Compression::Lzw => {
            let mut image = encoder.new_image_with_compression::<C, _>(width, height, Lzw)?;
            georef.write_to(image.encoder())?;
            image.write_data(samples)?;
        }
        Compression::Deflate => {
            let mut image =
                encoder.new_image_with_compression::<C, _>(width, height, Deflate::default())?;
            georef.write_to(image.encoder())?;
            image.write_data(samples)?;
        }
    }
    Ok(())
}
