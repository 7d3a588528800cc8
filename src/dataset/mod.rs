//! Labeled feature datasets
//!
//! A [`Dataset`] keeps four parallel fields, mirroring the JSON file it is
//! stored in: `mapping` (category names in label order), `labels`, `MFCCs`
//! and `files`. Entry `i` of `labels`, `MFCCs` and `files` describe the same
//! clip.

mod builder;

pub use builder::{BuildReport, DatasetBuilder};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::audio::FeatureMatrix;

/// Ordered category names; a label is an index into this list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMapping(Vec<String>);

impl LabelMapping {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// Mapping over the category names in lexicographic order
    pub fn from_categories<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self(names)
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every category here sits at the same index in `keywords`
    pub fn is_consistent_with(&self, keywords: &[String]) -> bool {
        self.0.len() <= keywords.len() && self.0.iter().zip(keywords).all(|(a, b)| a == b)
    }
}

/// One clip's features, label and origin
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledExample {
    pub features: FeatureMatrix,
    pub label: u32,
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub mapping: LabelMapping,
    pub labels: Vec<u32>,
    #[serde(rename = "MFCCs")]
    pub mfccs: Vec<FeatureMatrix>,
    pub files: Vec<String>,
}

impl Dataset {
    pub fn new(mapping: LabelMapping) -> Self {
        Self {
            mapping,
            ..Default::default()
        }
    }

    /// Append one example to all parallel fields at once
    pub fn push(&mut self, example: LabeledExample) {
        self.labels.push(example.label);
        self.mfccs.push(example.features);
        self.files.push(example.file);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<LabeledExample> {
        Some(LabeledExample {
            features: self.mfccs.get(index)?.clone(),
            label: *self.labels.get(index)?,
            file: self.files.get(index)?.clone(),
        })
    }

    /// (frames, coefficients) shared by all examples, if any
    pub fn feature_shape(&self) -> Option<(usize, usize)> {
        self.mfccs.first().map(FeatureMatrix::shape)
    }

    /// Number of examples per label index
    pub fn class_counts(&self) -> Vec<usize> {
        let classes = self
            .labels
            .iter()
            .map(|&l| l as usize + 1)
            .max()
            .unwrap_or(0)
            .max(self.mapping.len());
        let mut counts = vec![0; classes];
        for &label in &self.labels {
            counts[label as usize] += 1;
        }
        counts
    }

    /// Check that the parallel fields line up and share one feature shape
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.labels.len() == self.mfccs.len() && self.labels.len() == self.files.len(),
            "dataset fields are misaligned: {} labels, {} MFCCs, {} files",
            self.labels.len(),
            self.mfccs.len(),
            self.files.len()
        );

        if let Some(shape) = self.feature_shape() {
            for (i, matrix) in self.mfccs.iter().enumerate() {
                anyhow::ensure!(
                    matrix.shape() == shape,
                    "example {} ({}) has feature shape {:?}, expected {:?}",
                    i,
                    self.files[i],
                    matrix.shape(),
                    shape
                );
            }
        }

        if !self.mapping.is_empty() {
            if let Some(&label) = self.labels.iter().find(|&&l| l as usize >= self.mapping.len()) {
                anyhow::bail!(
                    "label {} is outside the {} mapped categories",
                    label,
                    self.mapping.len()
                );
            }
        }

        Ok(())
    }

    /// Write the dataset as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create dataset file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write dataset to {}", path.display()))?;
        Ok(())
    }

    /// Read and validate a dataset JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset file {}", path.display()))?;
        let dataset: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse dataset from {}", path.display()))?;
        dataset.validate()?;
        Ok(dataset)
    }
}
