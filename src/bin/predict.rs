//! Classify recordings with a trained keyword model
//!
//! Each path is either a file or a directory searched recursively for
//! `.wav` files.
//!
//! Usage:
//! ```sh
//! cargo run --release --features cli --bin predict -- Predict/ extra/yes.wav
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use keyword_spotting::{device_info, parse_device, KeywordSpottingService, KwsConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Predict the keyword spoken in each clip")]
struct Args {
    /// Files or directories to classify
    #[arg(default_value = "Predict")]
    paths: Vec<PathBuf>,

    /// Trained weights (the JSON sidecar must sit next to them)
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,

    /// JSON configuration overriding the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,
}

fn is_wav(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() && is_wav(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
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

    let device = parse_device(&args.device)?;
    tracing::info!("Predicting on {}", device_info(&device));

    let service = KeywordSpottingService::new(config, device);
    service.initialize()?;

    let mut failures = 0;
    for file in collect_files(&args.paths)? {
        match service.predict(&file) {
            Ok(prediction) => println!("{}: {}", file.display(), prediction),
            Err(err) => {
                failures += 1;
                tracing::error!("{}: {:#}", file.display(), err);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} files could not be classified");
    }
    Ok(())
}
