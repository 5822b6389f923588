use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use log::{info, warn};

use crate::config::PredictConfig;
use crate::dataset::TileDataset;
use crate::error::Result;
use crate::io::{read_metadata, GeoTiffFile, RasterOpener};
use crate::loader::{for_each_batch, LoaderOptions};
use crate::model::SegmentationModel;
use crate::runner::InferenceRunner;
use crate::transforms::Transform;
use crate::writer::TileWriter;

/// What a completed prediction run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictSummary {
    pub output: PathBuf,
    pub height: usize,
    pub width: usize,
    pub tiles: usize,
    pub batches: usize,
}

/// Segment a GeoTIFF and write the label raster to `output`.
///
/// Input samples are masked by the file's nodata value (NaN included),
/// scaled to `[0, 1]` by the range of their integer type and, for three band
/// imagery, ImageNet-normalised.
pub fn predict_tiff<M: SegmentationModel>(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    model: &M,
    config: &PredictConfig,
    progress: Option<&ProgressBar>,
) -> Result<PredictSummary> {
    let input = input.as_ref();
    config.validate()?;

    info!("Reading input raster: {}", input.display());
    let metadata = read_metadata(input)?;
    info!(
        "Raster size: {}x{}, {} band(s) of {}",
        metadata.width, metadata.height, metadata.bands, metadata.samples
    );
    metadata.georef.log_summary();

    let nodata = metadata.georef.nodata_value().map(|v| v as f32);
    let transform = Transform::standard(metadata.bands, nodata, metadata.samples.max_value());
    predict(GeoTiffFile::new(input), transform, output, model, config, progress)
}

/// Run the tiled pipeline over any raster source.
///
/// Configuration and tiling geometry are checked before any pixel is read.
/// On error the destination is left untouched.
pub fn predict<O, M>(
    opener: O,
    transform: Transform,
    output: impl AsRef<Path>,
    model: &M,
    config: &PredictConfig,
    progress: Option<&ProgressBar>,
) -> Result<PredictSummary>
where
    O: RasterOpener,
    M: SegmentationModel,
{
    config.validate()?;
    if model.device() != config.device {
        warn!(
            "Model is homed on {} but {} was requested",
            model.device(),
            config.device
        );
    }

    let dataset = TileDataset::new(opener, config.crop_size, config.stride(), transform)?;
    let grid = dataset.grid().clone();
    let (height, width) = grid.raster_dimensions();
    let num_batches = grid.num_batches(config.batch_size);
    info!(
        "Tile grid: {}x{} tiles (crop {}, stride {}, overlap {}), {} batch(es) of {}",
        grid.tiles_down,
        grid.tiles_across,
        grid.crop_size(),
        grid.stride(),
        grid.overlap(),
        num_batches,
        config.batch_size
    );
    info!(
        "{} reader worker(s), at most {} tiles in flight",
        config.workers,
        config.in_flight_tiles()
    );

    let runner = InferenceRunner::new(model, config.num_classes)?;
    let mut writer = TileWriter::create(
        output,
        grid.clone(),
        dataset.georef().clone(),
        config.merge,
        config.compression,
    )?;

    let hidden = ProgressBar::hidden();
    let progress = progress.unwrap_or(&hidden);
    progress.set_length(num_batches as u64);

    let options = LoaderOptions {
        batch_size: config.batch_size,
        workers: config.workers,
        prefetch: config.prefetch,
    };
    for_each_batch(&dataset, options, |batch| {
        let predictions = runner.run(batch)?;
        writer.write_all(&predictions)?;
        progress.inc(1);
        Ok(())
    })?;

    let output = writer.finish()?;
    progress.finish_with_message("done");

    Ok(PredictSummary {
        output,
        height,
        width,
        tiles: grid.len(),
        batches: num_batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KelpError;
    use crate::georef::GeoReference;
    use crate::io::MemoryRaster;
    use crate::model::FnModel;
    use ndarray::{Array3, Array4};

    fn background_model() -> FnModel<impl Fn(&Array4<f32>) -> Result<Array4<f32>>> {
        FnModel::new(|batch: &Array4<f32>| {
            let (n, _, h, w) = batch.dim();
            Ok(Array4::zeros((n, 2, h, w)))
        })
    }

    #[test]
    fn test_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let raster = MemoryRaster::new(Array3::zeros((1, 45, 30)), GeoReference::default());
        let config = PredictConfig {
            crop_size: 10,
            batch_size: 4,
            ..PredictConfig::default()
        };
        let summary = predict(
            raster,
            Transform::identity(),
            dir.path().join("out.tif"),
            &background_model(),
            &config,
            None,
        )
        .unwrap();

        assert_eq!(summary.tiles, 15);
        assert_eq!(summary.batches, 4);
        assert_eq!((summary.height, summary.width), (45, 30));
        assert!(summary.output.exists());
    }

    #[test]
    fn test_invalid_config_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tif");
        let raster = MemoryRaster::new(Array3::zeros((1, 10, 10)), GeoReference::default());
        let config = PredictConfig {
            stride: Some(300),
            ..PredictConfig::default()
        };
        let err = predict(raster, Transform::identity(), &dest, &background_model(), &config, None).unwrap_err();
        assert!(matches!(err, KelpError::InvalidGeometry(_)));
        assert!(!dest.exists());
    }
}
