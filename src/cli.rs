use std::path::PathBuf;

use clap::Parser;

use crate::config::{Device, DeviceRequest, PredictConfig};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "kelp-predict")]
#[command(about = "Segment kelp in a GeoTIFF with a tiled, batched model")]
#[command(version)]
pub struct Args {
    /// Input GeoTIFF path (imagery)
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Output GeoTIFF path (single-band 8-bit class labels)
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Model weights file (JSON pixel classifier)
    #[arg(short, long, value_name = "FILE")]
    pub weights: Option<PathBuf>,

    /// Checkpoint directory searched when --weights is not given
    #[arg(long, value_name = "DIR", requires = "name")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Run name under the checkpoint directory
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Tile edge length in pixels
    #[arg(long, default_value_t = 200, value_name = "PX")]
    pub crop_size: usize,

    /// Distance between tile origins (default: crop size, no overlap)
    #[arg(long, value_name = "PX")]
    pub stride: Option<usize>,

    /// Tiles per model invocation
    #[arg(short, long, default_value_t = 8, value_name = "N")]
    pub batch_size: usize,

    /// Number of output classes
    #[arg(long, default_value_t = 2, value_name = "N")]
    pub num_classes: usize,

    /// Device: cpu, cuda, cuda:N or auto
    #[arg(long, default_value = "auto", value_name = "DEVICE")]
    pub device: String,

    /// Parallel tile reader threads
    #[arg(long, default_value_t = 1, value_name = "N")]
    pub workers: usize,

    /// Batches read ahead of the model
    #[arg(long, default_value_t = 2, value_name = "N")]
    pub prefetch: usize,

    /// Overlap merge policy: trim or last-write-wins
    #[arg(long, default_value = "trim", value_name = "POLICY")]
    pub merge: String,

    /// Output compression (NONE, LZW, DEFLATE)
    #[arg(short, long, default_value = "NONE", value_name = "TYPE")]
    pub compression: String,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Show a progress bar
    #[arg(long)]
    pub progress: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn device(&self) -> Result<Device> {
        let requested: DeviceRequest = self.device.parse()?;
        Ok(Device::resolve(requested))
    }

    /// Build and validate the pipeline configuration.
    pub fn config(&self) -> Result<PredictConfig> {
        let config = PredictConfig {
            crop_size: self.crop_size,
            stride: self.stride,
            batch_size: self.batch_size,
            num_classes: self.num_classes,
            device: self.device()?,
            workers: self.workers,
            prefetch: self.prefetch,
            merge: self.merge.parse()?,
            compression: self.compression.parse()?,
        };
        config.validate()?;
        Ok(config)
    }
}
