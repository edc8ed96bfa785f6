use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use csrf_v1::{csrf_v1, Config, Split};

/// Prepare the CSRF V1 dataset and report the resulting splits.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "csrf-v1", version)]
struct Cli {
    /// Recording to load (.npz, .json, .pickle)
    #[arg(value_name = "DATA")]
    data: PathBuf,

    /// Take images_train / images_test from this file instead
    #[arg(long, value_name = "PATH")]
    images: Option<PathBuf>,

    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Seed for the split and all shuffling
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    train_frac: Option<f64>,

    #[arg(long)]
    subsample: Option<usize>,

    /// Pixels cropped from each border
    #[arg(long)]
    crop: Option<usize>,

    /// Time bins to sum, e.g. `0,1,2,3`
    #[arg(long, value_delimiter = ',', conflicts_with = "no_time_sum")]
    time_bins: Option<Vec<usize>>,

    /// Keep the time axis instead of summing bins
    #[arg(long)]
    no_time_sum: bool,

    /// Write the dataset summary as JSON
    #[arg(long, value_name = "FILE")]
    summary_out: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(v) = self.train_frac {
            config.train_frac = v;
        }
        if let Some(v) = self.subsample {
            config.subsample = v;
        }
        if let Some(v) = self.crop {
            config.crop = v;
        }
        if let Some(bins) = &self.time_bins {
            config.time_bins_sum = Some(bins.clone());
        }
        if self.no_time_sum {
            config.time_bins_sum = None;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.config()?;
    log::debug!("{config:?}");

    let mut loaders = csrf_v1(&cli.data, cli.images.as_deref(), &config)?;

    for split in Split::ALL {
        let loader = loaders.get_mut(split);
        let mut samples = 0;
        let mut batches = 0;
        for batch in loader.epoch() {
            samples += batch.len();
            batches += 1;
        }
        log::info!("{split}: one epoch = {batches} batches, {samples} samples");
    }

    let summary = loaders.summary();
    println!(
        "images {:?} (C, H, W), responses {:?} per sample, pixel mean {:.3} std {:.3}",
        summary.image_shape, summary.response_shape, summary.image_mean, summary.image_std
    );
    for s in &summary.splits {
        println!(
            "{:<10} {:>6} samples {:>5} batches {:>6.1}% valid",
            s.split.to_string(),
            s.samples,
            s.batches,
            100.0 * s.valid_fraction
        );
    }

    if let Some(path) = &cli.summary_out {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Wrote summary to {}", path.display());
    }
    Ok(())
}
