use std::path::PathBuf;

use thiserror::Error;

use crate::tiling::Window;

#[derive(Error, Debug)]
pub enum KelpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Invalid tiling geometry: {0}")]
    InvalidGeometry(String),

    #[error("Tile index {index} out of range (dataset has {len} tiles)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Failed to read window {window}: {source}")]
    Read {
        window: Window,
        #[source]
        source: Box<KelpError>,
    },

    #[error("Unsupported raster: {0}")]
    UnsupportedRaster(String),

    #[error("Tile loader stopped: {0}")]
    Loader(String),

    #[error("Inference failed on batch {batch}: {reason}")]
    InferenceFailure { batch: usize, reason: String },

    #[error("Failed to write {}: {reason}", path.display())]
    WriteFailure { path: PathBuf, reason: String },

    #[error("Prediction for tile {tile} has shape {actual:?}, expected {expected:?}")]
    GeometryMismatch {
        tile: usize,
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Output incomplete: {written} of {expected} tiles written")]
    IncompleteOutput { written: usize, expected: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl KelpError {
    /// Wrap a lower-level failure with the window that was being read.
    pub fn read(window: Window, source: impl Into<KelpError>) -> Self {
        KelpError::Read {
            window,
            source: Box::new(source.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KelpError>;
