//! Resampling to the system sample rate using rubato

use anyhow::{Context, Result};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as RubatoResampler, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::AudioBuffer;

const CHUNK_SIZE: usize = 1024;

/// Resampling quality preset
#[derive(Debug, Clone, Copy, Default)]
pub enum ResampleQuality {
    /// Cubic polynomial interpolation
    Fast,
    /// Sinc interpolation
    #[default]
    Normal,
    /// Longer sinc kernel, slower
    High,
}

/// Audio resampler
pub struct Resampler {
    quality: ResampleQuality,
}

impl Resampler {
    pub fn new(quality: ResampleQuality) -> Self {
        Self { quality }
    }

    /// Resample audio to a target sample rate.
    ///
    /// The output holds exactly `round(len * target / source)` samples,
    /// aligned with the input (the filter delay is removed).
    pub fn resample(&self, audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
        if audio.sample_rate == target_rate {
            return Ok(audio.clone());
        }
        anyhow::ensure!(audio.sample_rate > 0, "source sample rate is zero");

        let ratio = target_rate as f64 / audio.sample_rate as f64;
        let expected_len = (audio.len() as f64 * ratio).round() as usize;

        let output = match self.quality {
            ResampleQuality::Fast => {
                let mut resampler =
                    FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, CHUNK_SIZE, 1)
                        .context("Failed to create fast resampler")?;
                process_chunks(&mut resampler, &audio.samples, expected_len)?
            }
            ResampleQuality::Normal | ResampleQuality::High => {
                let (sinc_len, oversampling_factor) = match self.quality {
                    ResampleQuality::High => (256, 256),
                    _ => (128, 128),
                };
                let params = SincInterpolationParameters {
                    sinc_len,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor,
                    window: WindowFunction::BlackmanHarris2,
                };
                let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, 1)
                    .context("Failed to create sinc resampler")?;
                process_chunks(&mut resampler, &audio.samples, expected_len)?
            }
        };

        Ok(AudioBuffer::new(output, target_rate))
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(ResampleQuality::Normal)
    }
}

/// Feed fixed-size chunks through the resampler until `expected_len`
/// samples are available past the filter delay.
///
/// The last input chunk is zero padded and further all-zero chunks flush the
/// filter, so input lengths that are a multiple of the chunk size still
/// produce the full output.
fn process_chunks<R: RubatoResampler<f32>>(
    resampler: &mut R,
    samples: &[f32],
    expected_len: usize,
) -> Result<Vec<f32>> {
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected_len + delay + CHUNK_SIZE);
    let mut chunks = samples.chunks(CHUNK_SIZE);

    while output.len() < expected_len + delay {
        let mut input = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        input.resize(CHUNK_SIZE, 0.0);

        let result = resampler
            .process(&[input], None)
            .context("Resampling failed")?;

        match result.first() {
            Some(channel) if !channel.is_empty() => output.extend_from_slice(channel),
            _ => anyhow::bail!("resampler produced no output"),
        }
    }

    output.drain(..delay);
    output.truncate(expected_len);
    Ok(output)
}

/// Convenience function to resample audio
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    Resampler::default().resample(audio, target_rate)
}
