use std::fmt;

use log::debug;

use crate::error::{KelpError, Result};

/// A rectangular region of a raster's pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
}

impl Window {
    pub fn new(row: usize, col: usize, height: usize, width: usize) -> Self {
        Self {
            row,
            col,
            height,
            width,
        }
    }

    pub fn row_end(&self) -> usize {
        self.row + self.height
    }

    pub fn col_end(&self) -> usize {
        self.col + self.width
    }

    pub fn area(&self) -> usize {
        self.height * self.width
    }

    /// True if the window lies entirely inside a `height` x `width` raster.
    pub fn fits_within(&self, height: usize, width: usize) -> bool {
        self.row_end() <= height && self.col_end() <= width
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows {}..{}, cols {}..{}",
            self.row,
            self.row_end(),
            self.col,
            self.col_end()
        )
    }
}

/// One crop of the tile grid.
///
/// `row_offset`/`col_offset`/`height`/`width` describe the clamped window read
/// from the source raster. `core` is the sub-window this tile owns exclusively
/// when neighbouring tiles overlap; with no overlap it equals the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub index: usize,
    pub row_offset: usize,
    pub col_offset: usize,
    pub height: usize,
    pub width: usize,
    pub core: Window,
}

impl Tile {
    pub fn window(&self) -> Window {
        Window::new(self.row_offset, self.col_offset, self.height, self.width)
    }

    /// Position of the core window relative to the tile's own origin.
    pub fn core_in_tile(&self) -> Window {
        Window::new(
            self.core.row - self.row_offset,
            self.core.col - self.col_offset,
            self.core.height,
            self.core.width,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSpan {
    offset: usize,
    extent: usize,
    core_start: usize,
    core_end: usize,
}

/// Lay out tiles along one axis: origins at multiples of `stride`, the last
/// one clamped to the raster edge, overlaps split at their midpoint.
fn axis_spans(dim: usize, crop_size: usize, stride: usize) -> Vec<AxisSpan> {
    let count = if dim <= crop_size {
        1
    } else {
        (dim - crop_size + stride - 1) / stride + 1
    };

    let mut spans: Vec<AxisSpan> = (0..count)
        .map(|k| {
            let offset = k * stride;
            AxisSpan {
                offset,
                extent: crop_size.min(dim - offset),
                core_start: 0,
                core_end: dim,
            }
        })
        .collect();

    for k in 0..count - 1 {
        let (current, next) = (spans[k], spans[k + 1]);
        let boundary = (current.offset + current.extent + next.offset) / 2;
        spans[k].core_end = boundary;
        spans[k + 1].core_start = boundary;
    }

    spans
}

/// Deterministic row-major grid of crop windows covering a raster.
#[derive(Debug, Clone)]
pub struct TileGrid {
    raster_height: usize,
    raster_width: usize,
    crop_size: usize,
    stride: usize,
    rows: Vec<AxisSpan>,
    cols: Vec<AxisSpan>,
    pub tiles_down: usize,
    pub tiles_across: usize,
    pub total_tiles: usize,
}

impl TileGrid {
    /// Non-overlapping grid: every pixel is covered by exactly one tile.
    pub fn new(raster_height: usize, raster_width: usize, crop_size: usize) -> Result<Self> {
        Self::with_stride(raster_height, raster_width, crop_size, crop_size)
    }

    /// Grid whose neighbouring tiles overlap by `crop_size - stride` pixels.
    pub fn with_stride(
        raster_height: usize,
        raster_width: usize,
        crop_size: usize,
        stride: usize,
    ) -> Result<Self> {
        if raster_height == 0 || raster_width == 0 {
            return Err(KelpError::InvalidGeometry(format!(
                "raster dimensions must be positive, got {}x{}",
                raster_height, raster_width
            )));
        }
        if crop_size == 0 {
            return Err(KelpError::InvalidGeometry(
                "crop size must be positive".to_string(),
            ));
        }
        if stride == 0 || stride > crop_size {
            return Err(KelpError::InvalidGeometry(format!(
                "stride must be in 1..={} (crop size), got {}",
                crop_size, stride
            )));
        }

        let rows = axis_spans(raster_height, crop_size, stride);
        let cols = axis_spans(raster_width, crop_size, stride);
        let tiles_down = rows.len();
        let tiles_across = cols.len();
        let total_tiles = tiles_down * tiles_across;

        debug!(
            "TileGrid: {}x{} raster, crop_size={}, stride={} → {}x{} tiles ({} total)",
            raster_height, raster_width, crop_size, stride, tiles_down, tiles_across, total_tiles
        );

        Ok(Self {
            raster_height,
            raster_width,
            crop_size,
            stride,
            rows,
            cols,
            tiles_down,
            tiles_across,
            total_tiles,
        })
    }

    pub fn len(&self) -> usize {
        self.total_tiles
    }

    pub fn is_empty(&self) -> bool {
        self.total_tiles == 0
    }

    pub fn crop_size(&self) -> usize {
        self.crop_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn overlap(&self) -> usize {
        self.crop_size - self.stride
    }

    pub fn raster_dimensions(&self) -> (usize, usize) {
        (self.raster_height, self.raster_width)
    }

    /// Number of batches needed to consume every tile.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        (self.total_tiles + batch_size.max(1) - 1) / batch_size.max(1)
    }

    pub fn tile(&self, index: usize) -> Result<Tile> {
        if index >= self.total_tiles {
            return Err(KelpError::IndexOutOfRange {
                index,
                len: self.total_tiles,
            });
        }

        let row = self.rows[index / self.tiles_across];
        let col = self.cols[index % self.tiles_across];

        Ok(Tile {
            index,
            row_offset: row.offset,
            col_offset: col.offset,
            height: row.extent,
            width: col.extent,
            core: Window::new(
                row.core_start,
                col.core_start,
                row.core_end - row.core_start,
                col.core_end - col.core_start,
            ),
        })
    }

    pub fn iter(&self) -> TileIter<'_> {
        TileIter {
            grid: self,
            current_idx: 0,
        }
    }
}

pub struct TileIter<'a> {
    grid: &'a TileGrid,
    current_idx: usize,
}

impl<'a> Iterator for TileIter<'a> {
    type Item = Tile;

    fn next(&mut self) -> Option<Self::Item> {
        let tile = self.grid.tile(self.current_idx).ok()?;
        self.current_idx += 1;
        Some(tile)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.total_tiles - self.current_idx.min(self.grid.total_tiles);
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for TileIter<'a> {}
