//! Audio I/O utilities

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use super::resample;
use crate::error::KwsError;

/// Audio buffer holding raw waveform data
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono audio samples in [-1.0, 1.0] range
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a new audio buffer
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Save to WAV file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    /// Load from WAV file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

/// Load a WAV file into an AudioBuffer
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    // Convert to mono by averaging channels
    let mono_samples = if channels > 1 {
        samples
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok(AudioBuffer::new(mono_samples, sample_rate))
}

/// Decode a clip as mono at `sample_rate`, resampling when the file differs.
///
/// Any failure to read or convert the file is reported as
/// [`KwsError::DecodeFailure`].
pub fn load_clip<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<AudioBuffer, KwsError> {
    let path = path.as_ref();
    let decode_failure = |source: anyhow::Error| KwsError::DecodeFailure {
        path: path.to_path_buf(),
        source: source.into(),
    };

    let audio = load_wav(path).map_err(decode_failure)?;
    if audio.sample_rate == sample_rate {
        return Ok(audio);
    }

    tracing::debug!(
        "Resampling {} from {} Hz to {} Hz",
        path.display(),
        audio.sample_rate,
        sample_rate
    );
    resample::resample(&audio, sample_rate).map_err(decode_failure)
}

/// Save samples to a WAV file
pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    for &sample in samples {
        writer.write_sample(sample)?;
    }

    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 22050], 22050);
        assert!((buffer.duration() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wav_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        save_wav(&path, &samples, 22050).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate, 22050);
        assert_eq!(loaded.samples, samples);
    }

    #[test]
    fn test_load_int_stereo_downmix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), 100);
        assert!((loaded.samples[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_load_clip_missing_file() {
        let err = load_clip("/nonexistent/clip.wav", 22050).unwrap_err();
        assert!(matches!(err, KwsError::DecodeFailure { .. }));
    }

    #[test]
    fn test_load_clip_not_a_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "not audio").unwrap();
        let err = load_clip(&path, 22050).unwrap_err();
        assert!(matches!(err, KwsError::DecodeFailure { .. }));
    }

    #[test]
    fn test_load_clip_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip16k.wav");
        save_wav(&path, &vec![0.0; 16000], 16000).unwrap();

        let clip = load_clip(&path, 22050).unwrap();
        assert_eq!(clip.sample_rate, 22050);
        assert!(clip.len() > 20000);
    }
}
