use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use csrf_v1::data::loader::save_npz;
use csrf_v1::data::synthetic::{generate, SyntheticParams};

/// Write a synthetic CSRF-style recording for trying out the loader.
#[derive(Parser, Debug)]
#[command(name = "generate_sample")]
struct Args {
    #[arg(default_value = "sample_data.npz")]
    output: PathBuf,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 400)]
    train_images: usize,

    #[arg(long, default_value_t = 50)]
    test_images: usize,

    #[arg(long, default_value_t = 30)]
    neurons: usize,

    #[arg(long, default_value_t = 5)]
    sessions: usize,

    /// Side length of the square stimuli
    #[arg(long, default_value_t = 160)]
    size: usize,

    #[arg(long, default_value_t = 13)]
    time_bins: usize,

    /// Probability that a session did not see an image
    #[arg(long, default_value_t = 0.2)]
    missing_frac: f64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let params = SyntheticParams {
        train_images: args.train_images,
        test_images: args.test_images,
        neurons: args.neurons,
        sessions: args.sessions,
        time_bins: args.time_bins,
        height: args.size,
        width: args.size,
        missing_frac: args.missing_frac,
    };
    let raw = generate(&params, args.seed);
    save_npz(&raw, &args.output)?;

    println!(
        "Wrote {} train + {} test images ({}x{}), {} neurons x {} time bins to {}",
        params.train_images,
        params.test_images,
        params.height,
        params.width,
        params.neurons,
        params.time_bins,
        args.output.display()
    );
    Ok(())
}
