//! Fixed-length clip enforcement
//!
//! A clip shorter than the configured sample count is rejected, never
//! padded. A longer clip keeps its leading samples only; the keyword is
//! assumed to sit in the first second.

use super::AudioBuffer;
use crate::error::KwsError;

/// Clip of exactly `num_samples` samples
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedClip {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl NormalizedClip {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_buffer(self) -> AudioBuffer {
        AudioBuffer::new(self.samples, self.sample_rate)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioNormalizer {
    num_samples: usize,
}

impl AudioNormalizer {
    pub fn new(num_samples: usize) -> Self {
        Self { num_samples }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Cut `audio` to exactly `num_samples` samples
    pub fn normalize(&self, audio: AudioBuffer) -> Result<NormalizedClip, KwsError> {
        let AudioBuffer {
            mut samples,
            sample_rate,
        } = audio;

        if samples.len() < self.num_samples {
            return Err(KwsError::InsufficientAudio {
                actual: samples.len(),
                required: self.num_samples,
            });
        }

        samples.truncate(self.num_samples);
        Ok(NormalizedClip {
            samples,
            sample_rate,
        })
    }

    /// Borrowing variant of [`normalize`](Self::normalize)
    pub fn normalize_samples(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<NormalizedClip, KwsError> {
        if samples.len() < self.num_samples {
            return Err(KwsError::InsufficientAudio {
                actual: samples.len(),
                required: self.num_samples,
            });
        }

        Ok(NormalizedClip {
            samples: samples[..self.num_samples].to_vec(),
            sample_rate,
        })
    }
}

impl Default for AudioNormalizer {
    fn default() -> Self {
        Self::new(crate::config::NUM_SAMPLES)
    }
}
