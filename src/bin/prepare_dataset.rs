//! Build the MFCC dataset file from a corpus of keyword recordings
//!
//! The corpus root holds one directory per keyword, each full of WAV clips.
//!
//! Usage:
//! ```sh
//! cargo run --release --features cli --bin prepare_dataset -- \
//!     --dataset-path dataset --json-path data.json
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use keyword_spotting::config::{DATASET_PATH, DATA_PATH};
use keyword_spotting::{DatasetBuilder, KwsConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Extract MFCCs from a keyword corpus")]
struct Args {
    /// Corpus root with one subdirectory per keyword
    #[arg(long, default_value = DATASET_PATH)]
    dataset_path: PathBuf,

    /// Output dataset file
    #[arg(long, default_value = DATA_PATH)]
    json_path: PathBuf,

    /// JSON configuration overriding the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = KwsConfig::load_or_default(args.config.as_deref())?;

    let builder = DatasetBuilder::new(config.features.clone());
    let (dataset, report) = builder.build_with_report(&args.dataset_path)?;

    if !dataset.mapping.is_consistent_with(&config.keywords) {
        tracing::warn!(
            "Categories {:?} do not line up with the keyword order {:?}; training will refuse this dataset",
            dataset.mapping.names(),
            config.keywords
        );
    }

    dataset.save(&args.json_path)?;

    println!(
        "Wrote {} examples from {} categories to {}",
        report.accepted,
        report.categories,
        args.json_path.display()
    );
    if report.too_short + report.undecodable > 0 {
        println!(
            "Skipped {} clips shorter than {} samples and {} undecodable files",
            report.too_short, config.features.num_samples, report.undecodable
        );
    }
    for (name, count) in dataset.mapping.names().iter().zip(dataset.class_counts()) {
        println!("  {name:<10} {count}");
    }

    Ok(())
}
