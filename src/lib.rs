// Library exports for testing and reuse

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod curation;
pub mod dataset;
pub mod error;
pub mod georef;
pub mod io;
pub mod loader;
pub mod model;
pub mod predict;
pub mod runner;
pub mod tiling;
pub mod transforms;
pub mod writer;

// Re-export commonly used types
pub use config::{Compression, Device, DeviceRequest, MergePolicy, PredictConfig};
pub use error::{KelpError, Result};
pub use georef::GeoReference;
pub use io::{GeoTiffFile, GeoTiffSource, MemoryRaster, RasterOpener, RasterSource, SampleKind};
pub use model::{FnModel, ModelOutput, PixelClassifier, SegmentationModel};
pub use predict::{predict, predict_tiff, PredictSummary};
pub use runner::{InferenceRunner, Prediction};
pub use tiling::{Tile, TileGrid, Window};
pub use writer::TileWriter;
