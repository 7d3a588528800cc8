//! Shared configuration for feature extraction, training and inference
//!
//! Every stage reads its parameters from here. The feature parameters in
//! particular form the input contract of a trained model: a model is only
//! valid for the exact `FeatureConfig` it was trained with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sample rate every clip is decoded (and resampled) to
pub const SAMPLE_RATE: u32 = 22050;

/// Samples kept per clip: one second at `SAMPLE_RATE`
pub const NUM_SAMPLES: usize = 22050;

/// Cepstral coefficients per frame
pub const N_MFCC: usize = 13;

/// Analysis window size in samples
pub const N_FFT: usize = 2048;

/// Stride between frame starts in samples
pub const HOP_LENGTH: usize = 512;

/// Mel bands the power spectrum is folded into before the DCT
pub const N_MELS: usize = 128;

/// Dynamic range kept by the dB conversion
pub const TOP_DB: f32 = 80.0;

/// Size of the keyword vocabulary
pub const NUM_KEYWORDS: usize = 11;

/// Keywords in label order
pub const KEYWORDS: [&str; NUM_KEYWORDS] = [
    "down", "go", "happy", "left", "no", "off", "on", "right", "stop", "up", "yes",
];

/// Default location of the trained model weights
pub const MODEL_PATH: &str = "model.safetensors";

/// Default corpus root
pub const DATASET_PATH: &str = "dataset";

/// Default assembled dataset file
pub const DATA_PATH: &str = "data.json";

pub const LEARNING_RATE: f64 = 1e-4;
pub const EPOCHS: usize = 40;
pub const BATCH_SIZE: usize = 32;
pub const TEST_SIZE: f64 = 0.1;
pub const VALIDATION_SIZE: f64 = 0.1;

/// Parameters of the cepstral feature transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Rate clips are resampled to before anything else
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Exact number of samples a clip is cut to
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,

    #[serde(default = "default_n_mfcc")]
    pub n_mfcc: usize,

    #[serde(default = "default_n_fft")]
    pub n_fft: usize,

    #[serde(default = "default_hop_length")]
    pub hop_length: usize,

    #[serde(default = "default_n_mels")]
    pub n_mels: usize,

    /// Lowest filterbank frequency in Hz
    #[serde(default)]
    pub fmin: f32,

    /// Highest filterbank frequency in Hz (defaults to Nyquist)
    #[serde(default)]
    pub fmax: Option<f32>,

    /// Dynamic range floor in dB (`None` disables clipping)
    #[serde(default = "default_top_db")]
    pub top_db: Option<f32>,
}

fn default_sample_rate() -> u32 {
    SAMPLE_RATE
}

fn default_num_samples() -> usize {
    NUM_SAMPLES
}

fn default_n_mfcc() -> usize {
    N_MFCC
}

fn default_n_fft() -> usize {
    N_FFT
}

fn default_hop_length() -> usize {
    HOP_LENGTH
}

fn default_n_mels() -> usize {
    N_MELS
}

fn default_top_db() -> Option<f32> {
    Some(TOP_DB)
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            num_samples: default_num_samples(),
            n_mfcc: default_n_mfcc(),
            n_fft: default_n_fft(),
            hop_length: default_hop_length(),
            n_mels: default_n_mels(),
            fmin: 0.0,
            fmax: None,
            top_db: default_top_db(),
        }
    }
}

impl FeatureConfig {
    /// Frames produced for one clip.
    ///
    /// Frames are centered: the signal is padded by `n_fft / 2` on both
    /// sides, so the count is `1 + num_samples / hop_length` for even
    /// `n_fft`. For the defaults this is 44.
    pub fn num_frames(&self) -> usize {
        let padded = self.num_samples + 2 * (self.n_fft / 2);
        1 + (padded - self.n_fft) / self.hop_length
    }

    /// Network input shape as (channels, frames, coefficients)
    pub fn input_shape(&self) -> (usize, usize, usize) {
        (1, self.num_frames(), self.n_mfcc)
    }

    /// Upper filterbank edge, falling back to Nyquist
    pub fn fmax(&self) -> f32 {
        self.fmax.unwrap_or(self.sample_rate as f32 / 2.0)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.sample_rate > 0, "sample_rate must be positive");
        anyhow::ensure!(self.num_samples > 0, "num_samples must be positive");
        anyhow::ensure!(self.hop_length > 0, "hop_length must be positive");
        anyhow::ensure!(
            self.n_fft >= 2 && self.n_fft % 2 == 0,
            "n_fft must be even and at least 2, got {}",
            self.n_fft
        );
        anyhow::ensure!(self.n_mels > 0, "n_mels must be positive");
        anyhow::ensure!(
            self.n_mfcc > 0 && self.n_mfcc <= self.n_mels,
            "n_mfcc must be in 1..={}, got {}",
            self.n_mels,
            self.n_mfcc
        );
        anyhow::ensure!(
            self.fmin >= 0.0 && self.fmin < self.fmax(),
            "invalid filterbank range {}..{} Hz",
            self.fmin,
            self.fmax()
        );
        Ok(())
    }
}

/// Hyperparameters of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Fraction of the dataset held out for the final evaluation
    #[serde(default = "default_test_size")]
    pub test_size: f64,

    /// Fraction of the remainder held out for per-epoch validation
    #[serde(default = "default_validation_size")]
    pub validation_size: f64,

    /// Seed for the split and the per-epoch shuffle (random if unset)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_learning_rate() -> f64 {
    LEARNING_RATE
}

fn default_epochs() -> usize {
    EPOCHS
}

fn default_batch_size() -> usize {
    BATCH_SIZE
}

fn default_test_size() -> f64 {
    TEST_SIZE
}

fn default_validation_size() -> f64 {
    VALIDATION_SIZE
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            test_size: default_test_size(),
            validation_size: default_validation_size(),
            seed: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.learning_rate > 0.0,
            "learning_rate must be positive"
        );
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        for (name, value) in [
            ("test_size", self.test_size),
            ("validation_size", self.validation_size),
        ] {
            anyhow::ensure!(
                value > 0.0 && value < 1.0,
                "{name} must be in (0, 1), got {value}"
            );
        }
        Ok(())
    }
}

/// Top-level configuration consumed by every stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KwsConfig {
    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    /// Keyword vocabulary in label order
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,

    /// Where trained weights are written and read
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
}

fn default_keywords() -> Vec<String> {
    KEYWORDS.iter().map(|k| k.to_string()).collect()
}

fn default_model_path() -> PathBuf {
    PathBuf::from(MODEL_PATH)
}

impl Default for KwsConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            training: TrainingConfig::default(),
            keywords: default_keywords(),
            model_path: default_model_path(),
        }
    }
}

impl KwsConfig {
    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn num_keywords(&self) -> usize {
        self.keywords.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.features.validate()?;
        self.training.validate()?;
        anyhow::ensure!(!self.keywords.is_empty(), "keyword list is empty");
        for (i, keyword) in self.keywords.iter().enumerate() {
            anyhow::ensure!(
                !self.keywords[..i].contains(keyword),
                "duplicate keyword '{keyword}'"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_config_default() {
        let config = FeatureConfig::default();
        assert_eq!(config.sample_rate, 22050);
        assert_eq!(config.num_samples, 22050);
        assert_eq!(config.n_mfcc, 13);
        assert_eq!(config.n_fft, 2048);
        assert_eq!(config.hop_length, 512);
        assert_eq!(config.n_mels, 128);
        assert_eq!(config.top_db, Some(80.0));
        assert!((config.fmax() - 11025.0).abs() < 1e-3);
    }

    #[test]
    fn test_num_frames_pinned() {
        let config = FeatureConfig::default();
        assert_eq!(config.num_frames(), 44);
        // Same value as 1 + floor((N - 1) / hop) for these parameters
        assert_eq!(1 + (NUM_SAMPLES - 1) / HOP_LENGTH, 44);
        assert_eq!(config.input_shape(), (1, 44, 13));
    }

    #[test]
    fn test_num_frames_other_hop() {
        let config = FeatureConfig {
            hop_length: 256,
            ..Default::default()
        };
        assert_eq!(config.num_frames(), 1 + 22050 / 256);
    }

    #[test]
    fn test_feature_config_validate() {
        assert!(FeatureConfig::default().validate().is_ok());

        let bad_hop = FeatureConfig {
            hop_length: 0,
            ..Default::default()
        };
        assert!(bad_hop.validate().is_err());

        let too_many_coeffs = FeatureConfig {
            n_mfcc: 200,
            ..Default::default()
        };
        assert!(too_many_coeffs.validate().is_err());

        let odd_fft = FeatureConfig {
            n_fft: 2047,
            ..Default::default()
        };
        assert!(odd_fft.validate().is_err());
    }

    #[test]
    fn test_training_config_default() {
        let config = TrainingConfig::default();
        assert!((config.learning_rate - 1e-4).abs() < 1e-12);
        assert_eq!(config.epochs, 40);
        assert_eq!(config.batch_size, 32);
        assert!((config.test_size - 0.1).abs() < 1e-12);
        assert!((config.validation_size - 0.1).abs() < 1e-12);
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_training_config_rejects_bad_fraction() {
        let config = TrainingConfig {
            test_size: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keywords_order() {
        let config = KwsConfig::default();
        assert_eq!(config.num_keywords(), NUM_KEYWORDS);
        assert_eq!(config.keywords[0], "down");
        assert_eq!(config.keywords[10], "yes");
        let mut sorted = config.keywords.clone();
        sorted.sort();
        assert_eq!(sorted, config.keywords);
    }

    #[test]
    fn test_duplicate_keywords_rejected() {
        let config = KwsConfig {
            keywords: vec!["go".into(), "stop".into(), "go".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        let json = r#"{"training": {"epochs": 3}}"#;
        let config: KwsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.features, FeatureConfig::default());
        assert_eq!(config.model_path, PathBuf::from(MODEL_PATH));
    }

    #[test]
    fn test_config_serialization() {
        let config = KwsConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: KwsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_from_file_nonexistent() {
        let result = KwsConfig::from_file("/nonexistent/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kws.json");
        std::fs::write(&path, r#"{"features": {"hop_length": 256}}"#).unwrap();
        let config = KwsConfig::from_file(&path).unwrap();
        assert_eq!(config.features.hop_length, 256);
        assert_eq!(config.features.n_fft, 2048);
    }
}
