//! Train the keyword classifier on a prepared dataset file
//!
//! Usage:
//! ```sh
//! cargo run --release --features cli --bin train -- \
//!     --data-path data.json --model-path model.safetensors --epochs 40
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use keyword_spotting::config::DATA_PATH;
use keyword_spotting::training::train_from_file;
use keyword_spotting::{device_info, parse_device, KwsConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the keyword spotting CNN")]
struct Args {
    /// Dataset file written by prepare_dataset
    #[arg(long, default_value = DATA_PATH)]
    data_path: PathBuf,

    /// Where to write the trained weights
    #[arg(long)]
    model_path: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Random seed for the split and the shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,

    /// JSON configuration overriding the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the per-epoch history and test metrics as JSON
    #[arg(long)]
    json_output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = KwsConfig::load_or_default(args.config.as_deref())?;
    if let Some(path) = args.model_path {
        config.model_path = path;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.training.learning_rate = learning_rate;
    }
    if args.seed.is_some() {
        config.training.seed = args.seed;
    }

    let device = parse_device(&args.device)?;
    tracing::info!("Training on {}", device_info(&device));

    let model_path = config.model_path.clone();
    let report = train_from_file(config, device, &args.data_path)?;

    println!("Test loss: {:.4}", report.test.loss);
    println!("Test accuracy: {:.4}", report.test.accuracy);
    println!("Model saved to {}", model_path.display());

    if let Some(path) = args.json_output {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        println!("Report written to {}", path.display());
    }

    Ok(())
}
