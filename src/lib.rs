//! # Keyword Spotting
//!
//! Pure Rust keyword spotting over one-second speech clips: MFCC features,
//! a small convolutional classifier trained with candle, and an in-process
//! inference service.
//!
//! ## Features
//!
//! - **CPU**: Default, with optional MKL/Accelerate for faster BLAS
//! - **CUDA**: NVIDIA GPU acceleration
//! - **Metal**: Apple Silicon GPU acceleration
//! - **cli**: `prepare_dataset`, `train` and `predict` binaries
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyword_spotting::{auto_device, KeywordSpotter, KwsConfig};
//!
//! let spotter = KeywordSpotter::load(&KwsConfig::default(), auto_device()?)?;
//! println!("{}", spotter.predict("clip.wav")?);
//! ```

pub mod audio;
pub mod config;
pub mod dataset;
pub mod error;
pub mod models;
pub mod service;
pub mod training;

use anyhow::{Context, Result};
use candle_core::Device;
use std::path::Path;

/// Re-exports for convenience
pub use audio::{AudioBuffer, AudioNormalizer, FeatureMatrix, MfccExtractor};
pub use config::{FeatureConfig, KwsConfig, TrainingConfig};
pub use dataset::{Dataset, DatasetBuilder, LabelMapping};
pub use error::KwsError;
pub use models::{KeywordCnn, ModelMetadata};
pub use service::KeywordSpottingService;
pub use training::{Trainer, TrainingReport};

/// Outcome of classifying one clip
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Keyword {
        label: String,
        index: usize,
        /// Probability the model gave the winning keyword
        confidence: f32,
    },
    /// The clip is shorter than the fixed clip length
    FileTooSmall,
}

impl Prediction {
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Keyword { label, .. } => Some(label),
            Self::FileTooSmall => None,
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Keyword { index, .. } => Some(*index),
            Self::FileTooSmall => None,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        match self {
            Self::Keyword { confidence, .. } => Some(*confidence),
            Self::FileTooSmall => None,
        }
    }

    pub fn is_keyword(&self) -> bool {
        matches!(self, Self::Keyword { .. })
    }
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keyword { label, .. } => f.write_str(label),
            Self::FileTooSmall => f.write_str("file too small"),
        }
    }
}

/// A loaded model together with the feature pipeline it was trained on
pub struct KeywordSpotter {
    model: KeywordCnn,
    metadata: ModelMetadata,
    extractor: MfccExtractor,
    normalizer: AudioNormalizer,
    device: Device,
}

impl KeywordSpotter {
    /// Load the model at `config.model_path`, refusing one trained with
    /// different feature parameters or keywords
    pub fn load(config: &KwsConfig, device: Device) -> Result<Self> {
        let (model, metadata) = models::load_model(&config.model_path, &device)?;
        metadata.check_compatible(config)?;
        Ok(Self::from_model(model, metadata, device))
    }

    /// Wrap an already built model
    pub fn from_model(model: KeywordCnn, metadata: ModelMetadata, device: Device) -> Self {
        let normalizer = AudioNormalizer::new(metadata.features.num_samples);
        let extractor = MfccExtractor::new(metadata.features.clone());
        Self {
            model,
            metadata,
            extractor,
            normalizer,
            device,
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.metadata.keywords
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Classify the audio file at `path`
    pub fn predict<P: AsRef<Path>>(&self, path: P) -> Result<Prediction> {
        let path = path.as_ref();
        let audio = audio::load_clip(path, self.metadata.features.sample_rate)?;
        self.predict_buffer(audio)
            .with_context(|| format!("Failed to classify {}", path.display()))
    }

    pub fn predict_buffer(&self, audio: AudioBuffer) -> Result<Prediction> {
        let audio = if audio.sample_rate == self.metadata.features.sample_rate {
            audio
        } else {
            audio::resample::resample(&audio, self.metadata.features.sample_rate)?
        };

        match self.normalizer.normalize(audio) {
            Ok(clip) => self.predict_features(&self.extractor.extract(&clip)),
            Err(err) if err.is_insufficient_audio() => {
                tracing::debug!("{}", err);
                Ok(Prediction::FileTooSmall)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Classify an in-memory waveform
    pub fn predict_samples(&self, samples: &[f32], sample_rate: u32) -> Result<Prediction> {
        self.predict_buffer(AudioBuffer::new(samples.to_vec(), sample_rate))
    }

    /// Classify a ready feature matrix
    pub fn predict_features(&self, features: &FeatureMatrix) -> Result<Prediction> {
        let expected = (
            self.metadata.features.num_frames(),
            self.metadata.features.n_mfcc,
        );
        if features.shape() != expected {
            return Err(KwsError::ConfigMismatch(format!(
                "features are {:?}, model expects {:?}",
                features.shape(),
                expected
            ))
            .into());
        }

        let probs: Vec<f32> = self
            .model
            .forward(&features.to_tensor(&self.device)?)?
            .squeeze(0)?
            .to_vec1()?;
        let index = models::argmax(&probs).context("model produced no scores")?;
        let label = self.metadata.keywords.get(index).ok_or_else(|| {
            KwsError::ConfigMismatch(format!(
                "class {index} has no keyword among {} configured",
                self.metadata.keywords.len()
            ))
        })?;

        Ok(Prediction::Keyword {
            label: label.clone(),
            index,
            confidence: probs[index],
        })
    }
}

/// Select the best available device
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device name: `auto`, `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`
pub fn parse_device(name: &str) -> Result<Device> {
    let name = name.trim().to_lowercase();
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal: usize = ordinal
                .parse()
                .with_context(|| format!("Invalid device ordinal in '{name}'"))?;
            (kind, ordinal)
        }
        None => (name.as_str(), 0),
    };

    match kind {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal).context("CUDA device unavailable"),
        "metal" => Device::new_metal(ordinal).context("Metal device unavailable"),
        _ => anyhow::bail!("Unknown device '{name}' (expected auto, cpu, cuda[:N] or metal[:N])"),
    }
}

/// Short human-readable device description
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
