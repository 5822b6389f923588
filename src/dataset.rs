use log::{debug, info};
use ndarray::Array3;

use crate::error::Result;
use crate::georef::GeoReference;
use crate::io::{RasterOpener, RasterSource};
use crate::tiling::{Tile, TileGrid};
use crate::transforms::{pad_to, Transform};

/// Random access to the model-ready tiles of one raster.
///
/// Pixels are read from the source on demand. Each reader worker calls
/// [`TileDataset::reader`] to get a handle of its own, so no file handle is
/// shared between threads.
pub struct TileDataset<O: RasterOpener> {
    opener: O,
    grid: TileGrid,
    transform: Transform,
    bands: usize,
    georef: GeoReference,
}

impl<O: RasterOpener> TileDataset<O> {
    pub fn new(opener: O, crop_size: usize, stride: usize, transform: Transform) -> Result<Self> {
        let source = opener.open()?;
        let (height, width) = source.dimensions();
        let grid = TileGrid::with_stride(height, width, crop_size, stride)?;
        let bands = source.band_count();
        let georef = source.georef().clone();

        info!(
            "Dataset: {}x{} raster with {} band(s) → {} tiles of {}px",
            height,
            width,
            bands,
            grid.len(),
            crop_size
        );

        Ok(Self {
            opener,
            grid,
            transform,
            bands,
            georef,
        })
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn georef(&self) -> &GeoReference {
        &self.georef
    }

    pub fn band_count(&self) -> usize {
        self.bands
    }

    pub fn tile(&self, index: usize) -> Result<Tile> {
        self.grid.tile(index)
    }

    /// Open an independent reader onto the source raster.
    pub fn reader(&self) -> Result<TileReader<'_, O::Source>> {
        Ok(TileReader {
            source: self.opener.open()?,
            grid: &self.grid,
            transform: &self.transform,
        })
    }
}

/// A single-owner handle producing transformed tiles by index.
pub struct TileReader<'a, S: RasterSource> {
    source: S,
    grid: &'a TileGrid,
    transform: &'a Transform,
}

impl<'a, S: RasterSource> TileReader<'a, S> {
    /// Read, transform and zero-pad tile `index` to `crop_size` x `crop_size`.
    pub fn get(&mut self, index: usize) -> Result<Array3<f32>> {
        let tile = self.grid.tile(index)?;
        let window = tile.window();
        debug!("Reading tile {} ({})", index, window);

        let raw = self.source.read_window(&window)?;
        let transformed = self.transform.apply(raw)?;
        pad_to(transformed, self.grid.crop_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KelpError;
    use crate::io::MemoryRaster;

    fn gradient_raster(height: usize, width: usize) -> MemoryRaster {
        let data = Array3::from_shape_fn((1, height, width), |(_, r, c)| (r * width + c) as f32);
        MemoryRaster::new(data, GeoReference::default())
    }

    #[test]
    fn test_len_matches_grid() {
        let dataset = TileDataset::new(gradient_raster(205, 205), 200, 200, Transform::identity()).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.band_count(), 1);
    }

    #[test]
    fn test_edge_tile_is_zero_padded_to_crop_size() {
        let dataset = TileDataset::new(gradient_raster(205, 205), 200, 200, Transform::identity()).unwrap();
        let mut reader = dataset.reader().unwrap();

        let tile = reader.get(3).unwrap();
        assert_eq!(tile.dim(), (1, 200, 200));
        assert_eq!(tile[[0, 0, 0]], (200 * 205 + 200) as f32);
        assert_eq!(tile[[0, 4, 4]], (204 * 205 + 204) as f32);
        assert_eq!(tile[[0, 5, 0]], 0.0);
        assert_eq!(tile[[0, 0, 5]], 0.0);
    }

    #[test]
    fn test_reads_correct_window() {
        let dataset = TileDataset::new(gradient_raster(30, 20), 10, 10, Transform::identity()).unwrap();
        let mut reader = dataset.reader().unwrap();
        let tile = reader.get(3).unwrap();
        // Tile 3 is the second column of the second row
        assert_eq!(tile[[0, 0, 0]], (10 * 20 + 10) as f32);
    }

    #[test]
    fn test_index_out_of_range() {
        let dataset = TileDataset::new(gradient_raster(10, 10), 5, 5, Transform::identity()).unwrap();
        let mut reader = dataset.reader().unwrap();
        assert!(matches!(
            reader.get(4),
            Err(KelpError::IndexOutOfRange { index: 4, len: 4 })
        ));
    }

    #[test]
    fn test_zero_height_fails_before_reading() {
        let raster = MemoryRaster::new(Array3::zeros((1, 0, 10)), GeoReference::default());
        let err = TileDataset::new(raster, 200, 200, Transform::identity()).err().unwrap();
        assert!(matches!(err, KelpError::InvalidGeometry(_)));
    }

    #[test]
    fn test_independent_readers_agree() {
        let dataset = TileDataset::new(gradient_raster(64, 64), 16, 16, Transform::identity()).unwrap();
        let mut a = dataset.reader().unwrap();
        let mut b = dataset.reader().unwrap();
        for index in (0..dataset.len()).rev() {
            assert_eq!(a.get(index).unwrap(), b.get(index).unwrap());
        }
    }
}
