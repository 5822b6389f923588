use log::warn;
use ndarray::{s, Array3, Axis};

use crate::error::{KelpError, Result};

/// ImageNet channel statistics used by the pretrained segmentation backbones.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    /// Replace samples equal to `nodata` with `fill`. A NaN `nodata` matches NaN samples.
    MaskNodata { nodata: f32, fill: f32 },
    /// Multiply every sample by a constant.
    Scale(f32),
    /// Per-band `(x - mean) / std`.
    Normalize { mean: Vec<f32>, std: Vec<f32> },
    /// Keep only the listed bands, in the listed order.
    SelectBands(Vec<usize>),
    /// Zero-pad bottom and right edges up to `size` x `size`.
    PadTo { size: usize },
}

/// An ordered, deterministic pipeline applied to each tile before inference.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transform {
    steps: Vec<TransformStep>,
}

impl Transform {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: TransformStep) -> Self {
        self.steps.push(step);
        self
    }

    /// The inference transform: optional nodata masking, scaling by the
    /// sample type's `max_value` to `[0, 1]`, and ImageNet normalisation for
    /// RGB input. Samples without a fixed range are passed through unscaled.
    pub fn standard(bands: usize, nodata: Option<f32>, max_value: Option<f32>) -> Self {
        let mut transform = Self::identity();
        if let Some(nodata) = nodata {
            transform = transform.then(TransformStep::MaskNodata { nodata, fill: 0.0 });
        }
        match max_value {
            Some(max) if max > 0.0 => transform = transform.then(TransformStep::Scale(1.0 / max)),
            _ => warn!("Samples have no fixed range; feeding them to the model unscaled"),
        }
        if bands == 3 {
            transform = transform.then(TransformStep::Normalize {
                mean: IMAGENET_MEAN.to_vec(),
                std: IMAGENET_STD.to_vec(),
            });
        }
        transform
    }

    pub fn apply(&self, tile: Array3<f32>) -> Result<Array3<f32>> {
        self.steps.iter().try_fold(tile, |tile, step| apply_step(step, tile))
    }
}

fn apply_step(step: &TransformStep, mut tile: Array3<f32>) -> Result<Array3<f32>> {
    match step {
        TransformStep::MaskNodata { nodata, fill } => {
            let nan_nodata = nodata.is_nan();
            tile.mapv_inplace(|v| {
                if v == *nodata || (nan_nodata && v.is_nan()) {
                    *fill
                } else {
                    v
                }
            });
            Ok(tile)
        }
        TransformStep::Scale(factor) => {
            tile.mapv_inplace(|v| v * factor);
            Ok(tile)
        }
        TransformStep::Normalize { mean, std } => {
            let bands = tile.dim().0;
            if mean.len() != bands || std.len() != bands {
                return Err(KelpError::InvalidConfig(format!(
                    "normalize expects {} band statistics, got mean={} std={}",
                    bands,
                    mean.len(),
                    std.len()
                )));
            }
            if std.iter().any(|&s| s == 0.0) {
                return Err(KelpError::InvalidConfig(
                    "normalize std must be non-zero".to_string(),
                ));
            }
            for (band, mut plane) in tile.axis_iter_mut(Axis(0)).enumerate() {
                let (m, sd) = (mean[band], std[band]);
                plane.mapv_inplace(|v| (v - m) / sd);
            }
            Ok(tile)
        }
        TransformStep::SelectBands(indices) => {
            let bands = tile.dim().0;
            if let Some(&bad) = indices.iter().find(|&&i| i >= bands) {
                return Err(KelpError::InvalidConfig(format!(
                    "band {} selected but tile has {} bands",
                    bad, bands
                )));
            }
            Ok(tile.select(Axis(0), indices))
        }
        TransformStep::PadTo { size } => pad_to(tile, *size),
    }
}

/// Zero-pad a `(bands, h, w)` tile on the bottom and right to `size` x `size`.
pub fn pad_to(tile: Array3<f32>, size: usize) -> Result<Array3<f32>> {
    let (bands, height, width) = tile.dim();
    if height == size && width == size {
        return Ok(tile);
    }
    if height > size || width > size {
        return Err(KelpError::InvalidGeometry(format!(
            "tile {}x{} is larger than padded size {}",
            height, width, size
        )));
    }

    let mut padded = Array3::<f32>::zeros((bands, size, size));
    padded.slice_mut(s![.., ..height, ..width]).assign(&tile);
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::georef::GeoReference;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_standard_rgb_normalises_per_band() {
        let tile = Array3::from_elem((3, 2, 2), 255.0);
        let out = Transform::standard(3, None, Some(255.0)).apply(tile).unwrap();
        for band in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[band]) / IMAGENET_STD[band];
            assert_abs_diff_eq!(out[[band, 1, 1]], expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_standard_single_band_only_scales() {
        let tile = Array3::from_elem((1, 2, 2), 51.0);
        let out = Transform::standard(1, None, Some(255.0)).apply(tile).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_mask_nodata_before_scaling() {
        let mut tile = Array3::from_elem((1, 1, 2), 10.0);
        tile[[0, 0, 1]] = -9999.0;
        let out = Transform::standard(1, Some(-9999.0), Some(255.0)).apply(tile).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 1]], 0.0);
        assert_abs_diff_eq!(out[[0, 0, 0]], 10.0 / 255.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mask_nan_nodata() {
        let nodata = GeoReference::default().with_nodata("nan").nodata_value().map(|v| v as f32);
        assert!(nodata.map_or(false, f32::is_nan));

        let mut tile = Array3::from_elem((1, 1, 2), 10.0);
        tile[[0, 0, 1]] = f32::NAN;
        let out = Transform::standard(1, nodata, Some(255.0)).apply(tile).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 10.0 / 255.0, epsilon = 1e-6);
        assert_eq!(out[[0, 0, 1]], 0.0);
    }

    #[test]
    fn test_scale_follows_sample_range() {
        let tile = Array3::from_elem((1, 1, 1), 65535.0);
        let out = Transform::standard(1, None, Some(65535.0)).apply(tile).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 1.0, epsilon = 1e-6);

        let tile = Array3::from_elem((1, 1, 1), 0.37);
        let out = Transform::standard(1, None, None).apply(tile).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 0.37);
        assert_eq!(Transform::standard(1, None, None), Transform::identity());
    }

    #[test]
    fn test_normalize_band_mismatch() {
        let tile = Array3::zeros((4, 2, 2));
        let transform = Transform::identity().then(TransformStep::Normalize {
            mean: vec![0.0; 3],
            std: vec![1.0; 3],
        });
        assert!(matches!(
            transform.apply(tile),
            Err(KelpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_select_bands_reorders() {
        let tile = Array3::from_shape_fn((4, 1, 1), |(b, _, _)| b as f32);
        let out = Transform::identity()
            .then(TransformStep::SelectBands(vec![2, 1, 0]))
            .apply(tile)
            .unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![2.0, 1.0, 0.0]);

        let tile = Array3::zeros((2, 1, 1));
        assert!(Transform::identity()
            .then(TransformStep::SelectBands(vec![3]))
            .apply(tile)
            .is_err());
    }

    #[test]
    fn test_pad_to_keeps_origin_and_zero_fills() {
        let tile = Array3::from_elem((2, 5, 3), 7.0);
        let padded = pad_to(tile, 8).unwrap();
        assert_eq!(padded.dim(), (2, 8, 8));
        assert_eq!(padded[[1, 4, 2]], 7.0);
        assert_eq!(padded[[1, 5, 2]], 0.0);
        assert_eq!(padded[[0, 0, 3]], 0.0);
        assert_eq!(padded.sum(), 2.0 * 5.0 * 3.0 * 7.0);
    }

    #[test]
    fn test_pad_to_rejects_oversized_tile() {
        let tile = Array3::zeros((1, 9, 3));
        assert!(matches!(pad_to(tile, 8), Err(KelpError::InvalidGeometry(_))));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let tile = Array3::from_shape_fn((3, 4, 4), |(b, r, c)| (b * 16 + r * 4 + c) as f32);
        let transform = Transform::standard(3, None, Some(255.0)).then(TransformStep::PadTo { size: 6 });
        let a = transform.apply(tile.clone()).unwrap();
        let b = transform.apply(tile).unwrap();
        assert_eq!(a, b);
    }
}
