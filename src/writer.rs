use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use memmap2::MmapMut;
use ndarray::s;

use crate::config::{Compression, MergePolicy};
use crate::error::{KelpError, Result};
use crate::georef::GeoReference;
use crate::io::write_labels;
use crate::runner::Prediction;
use crate::tiling::{TileGrid, Window};

/// Stitches tile predictions into a single-band label GeoTIFF.
///
/// Labels are staged in a memory-mapped scratch file in the destination
/// directory. Nothing appears at the destination until [`TileWriter::finish`]
/// succeeds; dropping an unfinished writer discards the scratch data.
pub struct TileWriter {
    dest: PathBuf,
    grid: TileGrid,
    georef: GeoReference,
    merge: MergePolicy,
    compression: Compression,
    canvas: MmapMut,
    _scratch: File,
    written: Vec<bool>,
    written_count: usize,
}

impl TileWriter {
    pub fn create(
        dest: impl AsRef<Path>,
        grid: TileGrid,
        georef: GeoReference,
        merge: MergePolicy,
        compression: Compression,
    ) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        if dest.is_dir() {
            return Err(write_failure(&dest, "destination is a directory"));
        }
        let dir = output_dir(&dest);
        let (height, width) = grid.raster_dimensions();

        let scratch = tempfile::tempfile_in(&dir).map_err(|e| write_failure(&dest, e))?;
        scratch
            .set_len((height * width) as u64)
            .map_err(|e| write_failure(&dest, e))?;
        // Safety: the scratch file is unnamed and owned by this writer alone.
        let canvas = unsafe { MmapMut::map_mut(&scratch) }.map_err(|e| write_failure(&dest, e))?;

        info!(
            "Output canvas {}x{} ({:?} merge): {}",
            height,
            width,
            merge,
            dest.display()
        );

        Ok(Self {
            dest,
            written: vec![false; grid.len()],
            grid,
            georef,
            merge,
            compression,
            canvas,
            _scratch: scratch,
            written_count: 0,
        })
    }

    pub fn tiles_written(&self) -> usize {
        self.written_count
    }

    /// Place one prediction at its tile's position. Tiles may arrive in any
    /// order; under `Trim` the result does not depend on it.
    pub fn write(&mut self, prediction: &Prediction) -> Result<()> {
        let tile = self.grid.tile(prediction.tile.index)?;
        let expected = (1, tile.height, tile.width);
        let actual = prediction.labels.dim();
        if actual != expected || prediction.tile != tile {
            return Err(KelpError::GeometryMismatch {
                tile: tile.index,
                expected,
                actual,
            });
        }

        let region = match self.merge {
            MergePolicy::Trim => tile.core_in_tile(),
            MergePolicy::LastWriteWins => Window::new(0, 0, tile.height, tile.width),
        };
        debug!(
            "Writing tile {} ({}) region rows {}..{}, cols {}..{}",
            tile.index,
            tile.window(),
            region.row,
            region.row_end(),
            region.col,
            region.col_end()
        );

        let raster_width = self.grid.raster_dimensions().1;
        for row in region.row..region.row_end() {
            let start = (tile.row_offset + row) * raster_width + tile.col_offset + region.col;
            let dst = &mut self.canvas[start..start + region.width];
            for (px, label) in dst.iter_mut().zip(prediction.labels.slice(s![0, row, region.col..region.col_end()])) {
                *px = *label;
            }
        }

        if !self.written[tile.index] {
            self.written[tile.index] = true;
            self.written_count += 1;
        }
        Ok(())
    }

    pub fn write_all(&mut self, predictions: &[Prediction]) -> Result<()> {
        predictions.iter().try_for_each(|p| self.write(p))
    }

    /// Encode the stitched labels and move them into place at the destination.
    pub fn finish(self) -> Result<PathBuf> {
        if self.written_count != self.grid.len() {
            return Err(KelpError::IncompleteOutput {
                written: self.written_count,
                expected: self.grid.len(),
            });
        }

        let (height, width) = self.grid.raster_dimensions();
        let dir = output_dir(&self.dest);
        let mut staged = tempfile::Builder::new()
            .prefix(".kelp-predict-")
            .suffix(".tif.partial")
            .tempfile_in(&dir)
            .map_err(|e| write_failure(&self.dest, e))?;

        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            write_labels(&mut writer, height, width, &self.canvas, &self.georef, self.compression)?;
            writer.flush()?;
        }
        staged.as_file().sync_all()?;

        staged
            .persist(&self.dest)
            .map_err(|e| write_failure(&self.dest, e.error))?;

        info!("Wrote {} tiles to {}", self.written_count, self.dest.display());
        Ok(self.dest)
    }
}

fn output_dir(dest: &Path) -> PathBuf {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn write_failure(path: &Path, reason: impl ToString) -> KelpError {
    KelpError::WriteFailure {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
