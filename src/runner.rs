use log::{debug, info};
use ndarray::{s, Array3, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use crate::error::{KelpError, Result};
use crate::loader::Batch;
use crate::model::SegmentationModel;
use crate::tiling::Tile;

/// Largest class count representable in an 8-bit label raster.
pub const MAX_CLASSES: usize = 256;

/// Labels for one tile, shape `(1, tile.height, tile.width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub tile: Tile,
    pub labels: Array3<u8>,
}

/// Runs a model over loader batches and reduces scores to class labels.
pub struct InferenceRunner<'m, M: SegmentationModel> {
    model: &'m M,
    num_classes: usize,
}

impl<'m, M: SegmentationModel> InferenceRunner<'m, M> {
    pub fn new(model: &'m M, num_classes: usize) -> Result<Self> {
        if num_classes == 0 || num_classes > MAX_CLASSES {
            return Err(KelpError::InvalidConfig(format!(
                "num_classes must be in 1..={}, got {}",
                MAX_CLASSES, num_classes
            )));
        }
        info!(
            "Inference runner: {} classes on {}",
            num_classes,
            model.device()
        );
        Ok(Self { model, num_classes })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Score one batch and return a prediction per tile, in batch order.
    ///
    /// Any failure is reported as `InferenceFailure` for this batch.
    pub fn run(&self, batch: Batch) -> Result<Vec<Prediction>> {
        let index = batch.index;
        self.run_inner(batch).map_err(|e| match e {
            KelpError::InferenceFailure { .. } => e,
            other => KelpError::InferenceFailure {
                batch: index,
                reason: other.to_string(),
            },
        })
    }

    fn run_inner(&self, batch: Batch) -> Result<Vec<Prediction>> {
        let Batch { index, tiles, data } = batch;
        let (n, _, height, width) = data.dim();

        let input = self.model.to_device(data)?;
        let output = self.model.forward(&input)?;
        let scores = self.model.to_host(output.out)?;

        let expected = (n, self.num_classes, height, width);
        if scores.dim() != expected {
            return Err(KelpError::InferenceFailure {
                batch: index,
                reason: format!(
                    "model returned scores of shape {:?}, expected {:?}",
                    scores.dim(),
                    expected
                ),
            });
        }

        let labels = argmax_labels(scores.view())?;
        debug!("Batch {}: {} tile(s) labelled", index, tiles.len());

        Ok(tiles
            .into_iter()
            .enumerate()
            .map(|(i, tile)| {
                let labels = labels
                    .slice(s![i, ..tile.height, ..tile.width])
                    .to_owned()
                    .insert_axis(Axis(0));
                Prediction { tile, labels }
            })
            .collect())
    }
}

/// Per-pixel arg-max over the class axis of `(batch, classes, h, w)` scores.
///
/// Ties go to the lowest class index. A NaN score ranks above every number,
/// so the first NaN class along the axis wins its pixel.
pub fn argmax_labels(scores: ArrayView4<f32>) -> Result<Array3<u8>> {
    let (n, _, height, width) = scores.dim();
    let per_sample: Vec<Vec<u8>> = (0..n)
        .into_par_iter()
        .map(|i| sample_labels(scores.index_axis(Axis(0), i)))
        .collect();

    Ok(Array3::from_shape_vec((n, height, width), per_sample.concat())?)
}

fn sample_labels(scores: ArrayView3<f32>) -> Vec<u8> {
    let (classes, height, width) = scores.dim();
    let mut labels = Vec::with_capacity(height * width);
    for row in 0..height {
        for col in 0..width {
            let mut best = 0;
            let mut best_score = scores[[0, row, col]];
            if !best_score.is_nan() {
                for class in 1..classes {
                    let score = scores[[class, row, col]];
                    if score.is_nan() {
                        best = class;
                        break;
                    }
                    if score > best_score {
                        best = class;
                        best_score = score;
                    }
                }
            }
            labels.push(best as u8);
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FnModel;
    use crate::tiling::TileGrid;
    use ndarray::Array4;

    fn batch_for(grid: &TileGrid, index: usize, tiles: &[usize], bands: usize) -> Batch {
        let crop = grid.crop_size();
        Batch {
            index,
            tiles: tiles.iter().map(|&i| grid.tile(i).unwrap()).collect(),
            data: Array4::zeros((tiles.len(), bands, crop, crop)),
        }
    }

    #[test]
    fn test_argmax_ties_go_to_lowest_class() {
        let mut scores = Array4::<f32>::zeros((1, 3, 1, 3));
        // pixel 0: all equal; pixel 1: classes 1 and 2 tie; pixel 2: class 2 wins
        scores[[0, 1, 0, 1]] = 5.0;
        scores[[0, 2, 0, 1]] = 5.0;
        scores[[0, 2, 0, 2]] = 0.1;
        let labels = argmax_labels(scores.view()).unwrap();
        assert_eq!(labels.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_argmax_first_nan_wins() {
        let mut scores = Array4::<f32>::zeros((1, 3, 1, 3));
        // pixel 0: NaN in class 1 beats a larger class 2
        scores[[0, 1, 0, 0]] = f32::NAN;
        scores[[0, 2, 0, 0]] = 5.0;
        // pixel 1: NaN in class 0 holds against everything
        scores[[0, 0, 0, 1]] = f32::NAN;
        scores[[0, 2, 0, 1]] = f32::NAN;
        // pixel 2: later NaN still overrides an earlier maximum
        scores[[0, 1, 0, 2]] = 9.0;
        scores[[0, 2, 0, 2]] = f32::NAN;
        let labels = argmax_labels(scores.view()).unwrap();
        assert_eq!(labels.iter().copied().collect::<Vec<_>>(), vec![1, 0, 2]);
    }

    #[test]
    fn test_predictions_cropped_to_tile_extent() {
        let grid = TileGrid::new(205, 205, 200).unwrap();
        let model = FnModel::new(|batch: &Array4<f32>| {
            let (n, _, h, w) = batch.dim();
            let mut scores = Array4::<f32>::zeros((n, 2, h, w));
            scores.slice_mut(s![.., 1, .., ..]).fill(1.0);
            Ok(scores)
        });
        let runner = InferenceRunner::new(&model, 2).unwrap();

        let predictions = runner.run(batch_for(&grid, 0, &[0, 1, 2, 3], 1)).unwrap();
        let dims: Vec<_> = predictions.iter().map(|p| p.labels.dim()).collect();
        assert_eq!(dims, vec![(1, 200, 200), (1, 200, 5), (1, 5, 200), (1, 5, 5)]);
        assert!(predictions.iter().all(|p| p.labels.iter().all(|&l| l == 1)));
        assert_eq!(predictions[3].tile.index, 3);
    }

    #[test]
    fn test_model_error_reports_batch_index() {
        let grid = TileGrid::new(20, 20, 10).unwrap();
        let model = FnModel::new(|_: &Array4<f32>| Err(KelpError::InvalidConfig("device lost".to_string())));
        let runner = InferenceRunner::new(&model, 2).unwrap();

        let err = runner.run(batch_for(&grid, 3, &[2, 3], 1)).unwrap_err();
        match err {
            KelpError::InferenceFailure { batch, reason } => {
                assert_eq!(batch, 3);
                assert!(reason.contains("device lost"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_class_count_is_inference_failure() {
        let grid = TileGrid::new(10, 10, 10).unwrap();
        let model = FnModel::new(|batch: &Array4<f32>| {
            let (n, _, h, w) = batch.dim();
            Ok(Array4::zeros((n, 3, h, w)))
        });
        let runner = InferenceRunner::new(&model, 2).unwrap();
        assert!(matches!(
            runner.run(batch_for(&grid, 0, &[0], 1)),
            Err(KelpError::InferenceFailure { batch: 0, .. })
        ));
    }

    #[test]
    fn test_class_count_limits() {
        let model = FnModel::new(|batch: &Array4<f32>| Ok(batch.clone()));
        assert!(InferenceRunner::new(&model, 0).is_err());
        assert!(InferenceRunner::new(&model, 257).is_err());
        assert_eq!(InferenceRunner::new(&model, 256).unwrap().num_classes(), 256);
    }
}
