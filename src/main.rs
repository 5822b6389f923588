use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use kelp_predict::checkpoint::resolve_weights;
use kelp_predict::cli::Args;
use kelp_predict::error::{KelpError, Result};
use kelp_predict::{predict_tiff, PixelClassifier};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Kelp Segmentation Predictor ===");

    // Set thread pool size if specified
    if let Some(n_threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| KelpError::InvalidConfig(format!("thread pool: {}", e)))?;
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    let config = args.config()?;
    info!("Device: {}", config.device);

    let weights = resolve_weights(
        args.weights.as_deref(),
        args.checkpoint_dir.as_deref(),
        args.name.as_deref(),
    )?;
    let model = PixelClassifier::load(&weights)?;
    if model.num_classes() != config.num_classes {
        return Err(KelpError::InvalidConfig(format!(
            "weights define {} classes but --num-classes is {}",
            model.num_classes(),
            config.num_classes
        )));
    }

    let progress = if args.progress {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta}) {msg}")
            .map_err(|e| KelpError::InvalidConfig(e.to_string()))?
            .progress_chars("#>-");
        let pb = ProgressBar::new(0);
        pb.set_style(style);
        Some(pb)
    } else {
        None
    };

    let summary = predict_tiff(&args.input, &args.output, &model, &config, progress.as_ref())?;
    info!(
        "Labelled {}x{} raster in {} tiles / {} batches: {}",
        summary.height,
        summary.width,
        summary.tiles,
        summary.batches,
        summary.output.display()
    );

    info!("=== Done! ===");
    Ok(())
}
