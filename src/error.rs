//! Error conditions that callers branch on
//!
//! Most fallible functions return `anyhow::Result`. The variants here mark
//! the decision points of the pipeline: a too-short clip is skipped during
//! dataset assembly and reported as `FileTooSmall` at inference, a decode
//! failure aborts the current file, a missing model aborts initialization.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KwsError {
    /// Clip is shorter than the fixed sample count
    #[error("clip has {actual} samples, at least {required} required")]
    InsufficientAudio { actual: usize, required: usize },

    #[error("failed to decode audio from {path}")]
    DecodeFailure {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("model artifact not found at {0}")]
    MissingModelArtifact(PathBuf),

    /// Persisted model and running configuration disagree
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),
}

impl KwsError {
    pub fn is_insufficient_audio(&self) -> bool {
        matches!(self, Self::InsufficientAudio { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_audio_message() {
        let err = KwsError::InsufficientAudio {
            actual: 10000,
            required: 22050,
        };
        assert!(err.is_insufficient_audio());
        assert_eq!(
            err.to_string(),
            "clip has 10000 samples, at least 22050 required"
        );
    }

    #[test]
    fn test_decode_failure_source() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad header");
        let err = KwsError::DecodeFailure {
            path: PathBuf::from("clip.wav"),
            source: Box::new(io),
        };
        assert!(!err.is_insufficient_audio());
        assert!(err.to_string().contains("clip.wav"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "bad header");
    }
}
