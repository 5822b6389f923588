use std::fmt;
use std::str::FromStr;

use log::warn;

use crate::error::{KelpError, Result};

/// Compression applied to the output GeoTIFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lzw,
    Deflate,
}

impl FromStr for Compression {
    type Err = KelpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Compression::None),
            "LZW" => Ok(Compression::Lzw),
            "DEFLATE" => Ok(Compression::Deflate),
            _ => Err(KelpError::InvalidCompression(s.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "NONE",
            Compression::Lzw => "LZW",
            Compression::Deflate => "DEFLATE",
        };
        f.write_str(name)
    }
}

/// How overlapping tile predictions are merged into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Each tile writes only the core window it owns.
    #[default]
    Trim,
    /// Each tile writes its whole window; later writes overwrite earlier ones.
    LastWriteWins,
}

impl FromStr for MergePolicy {
    type Err = KelpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "trim" => Ok(MergePolicy::Trim),
            "last-write-wins" | "last" => Ok(MergePolicy::LastWriteWins),
            other => Err(KelpError::InvalidConfig(format!(
                "unknown merge policy '{}' (expected trim or last-write-wins)",
                other
            ))),
        }
    }
}

/// Where the model and its tensors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Resolve a device request against the backends compiled into this build.
    ///
    /// Only the CPU backend is built in, so accelerator requests fall back to
    /// the CPU with a warning.
    pub fn resolve(requested: DeviceRequest) -> Device {
        match requested {
            DeviceRequest::Auto | DeviceRequest::Exact(Device::Cpu) => Device::Cpu,
            DeviceRequest::Exact(device) => {
                warn!("{} is not available in this build, using cpu", device);
                Device::Cpu
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}

/// A device as requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    Auto,
    Exact(Device),
}

impl FromStr for DeviceRequest {
    type Err = KelpError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "auto" => Ok(DeviceRequest::Auto),
            "cpu" => Ok(DeviceRequest::Exact(Device::Cpu)),
            "cuda" | "gpu" => Ok(DeviceRequest::Exact(Device::Cuda(0))),
            _ => match s.strip_prefix("cuda:") {
                Some(ordinal) => ordinal
                    .parse()
                    .map(|n| DeviceRequest::Exact(Device::Cuda(n)))
                    .map_err(|_| KelpError::InvalidDevice(s.clone())),
                None => Err(KelpError::InvalidDevice(s.clone())),
            },
        }
    }
}

/// Settings consumed by the tiled prediction pipeline.
#[derive(Debug, Clone)]
pub struct PredictConfig {
    /// Tile edge length in pixels; also the model input size.
    pub crop_size: usize,
    /// Distance between tile origins; `None` means `crop_size` (no overlap).
    pub stride: Option<usize>,
    /// Tiles per model invocation.
    pub batch_size: usize,
    pub num_classes: usize,
    pub device: Device,
    /// Parallel tile reader threads.
    pub workers: usize,
    /// Batches that may be read ahead of the model.
    pub prefetch: usize,
    pub merge: MergePolicy,
    pub compression: Compression,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            crop_size: 200,
            stride: None,
            batch_size: 8,
            num_classes: 2,
            device: Device::Cpu,
            workers: 1,
            prefetch: 2,
            merge: MergePolicy::Trim,
            compression: Compression::None,
        }
    }
}

impl PredictConfig {
    pub fn stride(&self) -> usize {
        self.stride.unwrap_or(self.crop_size)
    }

    /// Most tiles held in memory between the readers and the model.
    pub fn in_flight_tiles(&self) -> usize {
        self.batch_size * self.prefetch
    }

    pub fn validate(&self) -> Result<()> {
        if self.crop_size == 0 {
            return Err(KelpError::InvalidGeometry(
                "crop size must be positive".to_string(),
            ));
        }
        let stride = self.stride();
        if stride == 0 || stride > self.crop_size {
            return Err(KelpError::InvalidGeometry(format!(
                "stride must be in 1..={} (crop size), got {}",
                self.crop_size, stride
            )));
        }
        if self.batch_size == 0 {
            return Err(KelpError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.num_classes == 0 || self.num_classes > 256 {
            return Err(KelpError::InvalidConfig(format!(
                "number of classes must be in 1..=256 for 8-bit labels, got {}",
                self.num_classes
            )));
        }
        if self.workers == 0 {
            return Err(KelpError::InvalidConfig(
                "at least one reader worker is required".to_string(),
            ));
        }
        if self.prefetch == 0 {
            return Err(KelpError::InvalidConfig(
                "prefetch depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compression_valid() {
        assert_eq!("DEFLATE".parse::<Compression>().unwrap(), Compression::Deflate);
        assert_eq!("lzw".parse::<Compression>().unwrap(), Compression::Lzw);
        assert_eq!("NONE".parse::<Compression>().unwrap(), Compression::None);
    }

    #[test]
    fn test_parse_compression_invalid() {
        assert!("INVALID".parse::<Compression>().is_err());
        assert!("jpeg".parse::<Compression>().is_err());
    }

    #[test]
    fn test_parse_merge_policy() {
        assert_eq!("trim".parse::<MergePolicy>().unwrap(), MergePolicy::Trim);
        assert_eq!(
            "last_write_wins".parse::<MergePolicy>().unwrap(),
            MergePolicy::LastWriteWins
        );
        assert!("blend".parse::<MergePolicy>().is_err());
    }

    #[test]
    fn test_parse_device() {
        assert_eq!("auto".parse::<DeviceRequest>().unwrap(), DeviceRequest::Auto);
        assert_eq!(
            "CPU".parse::<DeviceRequest>().unwrap(),
            DeviceRequest::Exact(Device::Cpu)
        );
        assert_eq!(
            "cuda:1".parse::<DeviceRequest>().unwrap(),
            DeviceRequest::Exact(Device::Cuda(1))
        );
        assert!("cuda:x".parse::<DeviceRequest>().is_err());
        assert!("tpu".parse::<DeviceRequest>().is_err());
    }

    #[test]
    fn test_device_falls_back_to_cpu() {
        assert_eq!(Device::resolve(DeviceRequest::Auto), Device::Cpu);
        assert_eq!(
            Device::resolve(DeviceRequest::Exact(Device::Cuda(0))),
            Device::Cpu
        );
    }

    #[test]
    fn test_validate_defaults() {
        let config = PredictConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stride(), 200);
        assert_eq!(config.in_flight_tiles(), 16);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_crop = PredictConfig {
            crop_size: 0,
            ..Default::default()
        };
        assert!(matches!(bad_crop.validate(), Err(KelpError::InvalidGeometry(_))));

        let bad_stride = PredictConfig {
            stride: Some(300),
            ..Default::default()
        };
        assert!(matches!(bad_stride.validate(), Err(KelpError::InvalidGeometry(_))));

        let bad_batch = PredictConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(bad_batch.validate(), Err(KelpError::InvalidConfig(_))));

        let too_many_classes = PredictConfig {
            num_classes: 300,
            ..Default::default()
        };
        assert!(too_many_classes.validate().is_err());
    }
}
