use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::info;
use ndarray::{s, stack, Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Device;
use crate::error::{KelpError, Result};

/// Output of a segmentation forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Per-class scores, shape `(batch, num_classes, height, width)`.
    pub out: Array4<f32>,
}

/// A segmentation network that can be run over a batch of tiles.
///
/// `forward` takes `&self`: running inference can never update parameters.
pub trait SegmentationModel {
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Move an input batch onto the model's device.
    fn to_device(&self, batch: Array4<f32>) -> Result<Array4<f32>> {
        Ok(batch)
    }

    /// Move scores back to host memory.
    fn to_host(&self, scores: Array4<f32>) -> Result<Array4<f32>> {
        Ok(scores)
    }

    /// Score a `(batch, bands, height, width)` input.
    fn forward(&self, batch: &Array4<f32>) -> Result<ModelOutput>;
}

/// Adapts a plain function into a [`SegmentationModel`].
pub struct FnModel<F>(F);

impl<F> FnModel<F>
where
    F: Fn(&Array4<f32>) -> Result<Array4<f32>>,
{
    pub fn new(forward: F) -> Self {
        Self(forward)
    }
}

impl<F> SegmentationModel for FnModel<F>
where
    F: Fn(&Array4<f32>) -> Result<Array4<f32>>,
{
    fn forward(&self, batch: &Array4<f32>) -> Result<ModelOutput> {
        Ok(ModelOutput {
            out: (self.0)(batch)?,
        })
    }
}

/// Per-pixel linear classifier (a 1x1 convolution).
///
/// `weights[c][b]` is the contribution of band `b` to the score of class `c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelClassifier {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl PixelClassifier {
    pub fn new(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Result<Self> {
        let model = Self { weights, bias };
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading pixel classifier weights: {}", path.display());
        let file = File::open(path)?;
        let model: Self = serde_json::from_reader(BufReader::new(file))?;
        model.validate()?;
        info!(
            "Loaded classifier: {} band(s) → {} classes",
            model.in_channels(),
            model.num_classes()
        );
        Ok(model)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.weights.len()
    }

    pub fn in_channels(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    fn validate(&self) -> Result<()> {
        if self.weights.is_empty() || self.in_channels() == 0 {
            return Err(KelpError::InvalidConfig(
                "classifier needs at least one class and one band".to_string(),
            ));
        }
        if self.bias.len() != self.weights.len() {
            return Err(KelpError::InvalidConfig(format!(
                "classifier has {} weight rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        if self.weights.iter().any(|row| row.len() != self.in_channels()) {
            return Err(KelpError::InvalidConfig(
                "classifier weight rows differ in length".to_string(),
            ));
        }
        Ok(())
    }

    fn score_sample(&self, sample: ArrayView3<f32>) -> Array3<f32> {
        let (_, height, width) = sample.dim();
        let mut scores = Array3::<f32>::zeros((self.num_classes(), height, width));
        for (class, (row, &bias)) in self.weights.iter().zip(&self.bias).enumerate() {
            let mut plane = scores.slice_mut(s![class, .., ..]);
            plane.fill(bias);
            for (band, &weight) in row.iter().enumerate() {
                plane.scaled_add(weight, &sample.slice(s![band, .., ..]));
            }
        }
        scores
    }
}

impl SegmentationModel for PixelClassifier {
    fn forward(&self, batch: &Array4<f32>) -> Result<ModelOutput> {
        let bands = batch.dim().1;
        if bands != self.in_channels() {
            return Err(KelpError::InvalidConfig(format!(
                "classifier expects {} band(s), batch has {}",
                self.in_channels(),
                bands
            )));
        }

        let per_sample: Vec<Array3<f32>> = (0..batch.dim().0)
            .into_par_iter()
            .map(|i| self.score_sample(batch.index_axis(Axis(0), i)))
            .collect();
        let views: Vec<ArrayView3<f32>> = per_sample.iter().map(|a| a.view()).collect();

        Ok(ModelOutput {
            out: stack(Axis(0), &views)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_pixel_classifier_scores() {
        let model = PixelClassifier::new(vec![vec![1.0, 0.0], vec![0.5, 2.0]], vec![0.0, -1.0]).unwrap();
        let mut batch = Array4::<f32>::zeros((2, 2, 3, 3));
        batch[[1, 0, 2, 2]] = 4.0;
        batch[[1, 1, 2, 2]] = 1.0;

        let out = model.forward(&batch).unwrap().out;
        assert_eq!(out.dim(), (2, 2, 3, 3));
        assert_abs_diff_eq!(out[[0, 1, 0, 0]], -1.0);
        assert_abs_diff_eq!(out[[1, 0, 2, 2]], 4.0);
        assert_abs_diff_eq!(out[[1, 1, 2, 2]], 0.5 * 4.0 + 2.0 - 1.0);
    }

    #[test]
    fn test_pixel_classifier_rejects_band_mismatch() {
        let model = PixelClassifier::new(vec![vec![1.0]], vec![0.0]).unwrap();
        let batch = Array4::<f32>::zeros((1, 3, 2, 2));
        assert!(model.forward(&batch).is_err());
    }

    #[test]
    fn test_invalid_weights() {
        assert!(PixelClassifier::new(vec![], vec![]).is_err());
        assert!(PixelClassifier::new(vec![vec![1.0]], vec![0.0, 1.0]).is_err());
        assert!(PixelClassifier::new(vec![vec![1.0], vec![1.0, 2.0]], vec![0.0, 1.0]).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let model = PixelClassifier::new(vec![vec![0.1, 0.2, 0.3], vec![-0.1, 0.0, 0.4]], vec![0.5, -0.5]).unwrap();
        model.save(&path).unwrap();
        assert_eq!(PixelClassifier::load(&path).unwrap(), model);
    }

    #[test]
    fn test_fn_model_wraps_closure() {
        let model = FnModel::new(|batch: &Array4<f32>| Ok(batch.clone()));
        let batch = Array4::from_elem((1, 2, 1, 1), 3.0);
        assert_eq!(model.forward(&batch).unwrap().out, batch);
        assert_eq!(model.device(), Device::Cpu);
    }
}
