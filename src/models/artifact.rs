//! Model persistence
//!
//! A trained model is two files: the weights as safetensors at the model
//! path, and a JSON sidecar next to it (same stem, `.json` extension)
//! recording the layer list, the keyword order and the feature parameters
//! the weights were trained with.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::cnn::KeywordCnn;
use super::layers::{keyword_cnn, LayerSpec, Shape};
use crate::config::{FeatureConfig, KwsConfig};
use crate::error::KwsError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub features: FeatureConfig,
    pub keywords: Vec<String>,
    pub layers: Vec<LayerSpec>,
}

impl ModelMetadata {
    /// Metadata for the standard architecture under `config`
    pub fn new(config: &KwsConfig) -> Self {
        Self {
            features: config.features.clone(),
            keywords: config.keywords.clone(),
            layers: keyword_cnn(config.num_keywords()),
        }
    }

    pub fn input_shape(&self) -> Shape {
        let (c, h, w) = self.features.input_shape();
        Shape::Spatial(c, h, w)
    }

    /// Location of the sidecar for the weights at `weights_path`
    pub fn sidecar_path(weights_path: &Path) -> PathBuf {
        weights_path.with_extension("json")
    }

    /// Build the network these weights belong to
    pub fn build(&self, vb: VarBuilder) -> Result<KeywordCnn> {
        KeywordCnn::new(self.input_shape(), &self.layers, vb)
    }

    /// Refuse a model whose input contract or labels differ from `config`
    pub fn check_compatible(&self, config: &KwsConfig) -> Result<(), KwsError> {
        if self.features != config.features {
            return Err(KwsError::ConfigMismatch(format!(
                "model was trained with feature parameters {:?}, configured {:?}",
                self.features, config.features
            )));
        }
        if self.keywords != config.keywords {
            return Err(KwsError::ConfigMismatch(format!(
                "model keywords {:?} differ from configured {:?}",
                self.keywords, config.keywords
            )));
        }
        Ok(())
    }
}

/// Write the weights held in `varmap` and the metadata sidecar
pub fn save_model(varmap: &VarMap, metadata: &ModelMetadata, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    varmap
        .save(path)
        .with_context(|| format!("Failed to save weights to {}", path.display()))?;

    let sidecar = ModelMetadata::sidecar_path(path);
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&sidecar, json)
        .with_context(|| format!("Failed to write model metadata to {}", sidecar.display()))?;

    tracing::info!("Saved model to {}", path.display());
    Ok(())
}

/// Read the metadata sidecar of the weights at `path`
pub fn load_metadata(path: &Path) -> Result<ModelMetadata> {
    let sidecar = ModelMetadata::sidecar_path(path);
    if !sidecar.exists() {
        return Err(KwsError::MissingModelArtifact(sidecar).into());
    }
    let content = std::fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read {}", sidecar.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse model metadata from {}", sidecar.display()))
}

/// Load a persisted model for inference
pub fn load_model(path: &Path, device: &Device) -> Result<(KeywordCnn, ModelMetadata)> {
    if !path.exists() {
        return Err(KwsError::MissingModelArtifact(path.to_path_buf()).into());
    }
    let metadata = load_metadata(path)?;

    let weights: HashMap<String, Tensor> = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;
    let vb = VarBuilder::from_tensors(weights, DType::F32, device);
    let model = metadata
        .build(vb)
        .with_context(|| format!("Weights at {} do not fit the recorded layers", path.display()))?;

    tracing::info!(
        "Loaded model from {} ({} parameters, {} keywords)",
        path.display(),
        model.num_parameters(),
        metadata.keywords.len()
    );
    Ok((model, metadata))
}
