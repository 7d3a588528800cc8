//! Corpus traversal and feature accumulation
//!
//! The corpus root holds one subdirectory per category. Categories are
//! sorted by name and labeled by position, so the label of a category does
//! not depend on the order the filesystem happens to list directories in.
//! Files are decoded, cut to the fixed length and turned into MFCCs; a clip
//! that is too short or cannot be decoded is left out of every field.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{Dataset, LabelMapping, LabeledExample};
use crate::audio::{load_clip, AudioNormalizer, FeatureMatrix, MfccExtractor};
use crate::config::FeatureConfig;
use crate::error::KwsError;

/// Counts of what happened while assembling a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub categories: usize,
    pub accepted: usize,
    pub too_short: usize,
    pub undecodable: usize,
}

enum FileOutcome {
    Accepted(FeatureMatrix),
    TooShort,
    Undecodable,
}

pub struct DatasetBuilder {
    extractor: MfccExtractor,
    normalizer: AudioNormalizer,
}

impl DatasetBuilder {
    pub fn new(config: FeatureConfig) -> Self {
        let normalizer = AudioNormalizer::new(config.num_samples);
        Self {
            extractor: MfccExtractor::new(config),
            normalizer,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        self.extractor.config()
    }

    /// Category directories under `root`, sorted by name
    pub fn categories(root: &Path) -> Result<Vec<(String, PathBuf)>> {
        anyhow::ensure!(
            root.is_dir(),
            "dataset root {} is not a directory",
            root.display()
        );

        let mut categories = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to list {}", root.display()))?;
            if entry.file_type().is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                categories.push((name, entry.into_path()));
            }
        }
        Ok(categories)
    }

    /// Assemble the dataset for the corpus at `root`
    pub fn build(&self, root: &Path) -> Result<Dataset> {
        self.build_with_report(root).map(|(dataset, _)| dataset)
    }

    pub fn build_with_report(&self, root: &Path) -> Result<(Dataset, BuildReport)> {
        let categories = Self::categories(root)?;
        let mapping = LabelMapping::new(categories.iter().map(|(name, _)| name.clone()).collect());
        let mut dataset = Dataset::new(mapping);
        let mut report = BuildReport {
            categories: categories.len(),
            ..Default::default()
        };

        for (label, (category, dir)) in categories.iter().enumerate() {
            let label = label as u32;
            tracing::info!("Processing {}", category);

            let files = category_files(dir)?;
            let outcomes: Vec<FileOutcome> =
                files.par_iter().map(|path| self.process_file(path)).collect();

            for (path, outcome) in files.into_iter().zip(outcomes) {
                match outcome {
                    FileOutcome::Accepted(features) => {
                        let file = path.to_string_lossy().into_owned();
                        tracing::debug!("{}: {}", file, label);
                        dataset.push(LabeledExample {
                            features,
                            label,
                            file,
                        });
                        report.accepted += 1;
                    }
                    FileOutcome::TooShort => report.too_short += 1,
                    FileOutcome::Undecodable => report.undecodable += 1,
                }
            }
        }

        tracing::info!(
            "Built dataset: {} examples over {} categories ({} too short, {} undecodable)",
            report.accepted,
            report.categories,
            report.too_short,
            report.undecodable
        );

        Ok((dataset, report))
    }

    fn process_file(&self, path: &Path) -> FileOutcome {
        let audio = match load_clip(path, self.config().sample_rate) {
            Ok(audio) => audio,
            Err(err) => {
                tracing::warn!("Skipping {}: {}", path.display(), err);
                return FileOutcome::Undecodable;
            }
        };

        match self.normalizer.normalize(audio) {
            Ok(clip) => FileOutcome::Accepted(self.extractor.extract(&clip)),
            Err(KwsError::InsufficientAudio { actual, required }) => {
                tracing::debug!(
                    "Skipping {}: {} samples, need {}",
                    path.display(),
                    actual,
                    required
                );
                FileOutcome::TooShort
            }
            Err(err) => {
                tracing::warn!("Skipping {}: {}", path.display(), err);
                FileOutcome::Undecodable
            }
        }
    }
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

/// Regular files directly inside `dir`, sorted by name
fn category_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
