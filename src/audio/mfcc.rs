//! MFCC feature extraction
//!
//! Pipeline per clip: centered STFT with a periodic Hann window, power
//! spectrum, Slaney mel filterbank, power-to-dB with a `top_db` floor, and
//! an orthonormal DCT-II keeping the first `n_mfcc` coefficients. The output
//! is time-major: one row of `n_mfcc` values per frame.

use anyhow::Result;
use candle_core::{Device, Tensor};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

use super::NormalizedClip;
use crate::config::FeatureConfig;

/// Smallest power value before taking the logarithm
const AMIN: f32 = 1e-10;

/// Frames x coefficients matrix produced for one clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureMatrix(Vec<Vec<f32>>);

impl FeatureMatrix {
    /// Wrap rows of equal width
    pub fn new(frames: Vec<Vec<f32>>) -> Result<Self> {
        if let Some(first) = frames.first() {
            let width = first.len();
            anyhow::ensure!(
                frames.iter().all(|frame| frame.len() == width),
                "feature frames have differing coefficient counts"
            );
        }
        Ok(Self(frames))
    }

    pub fn num_frames(&self) -> usize {
        self.0.len()
    }

    pub fn num_coefficients(&self) -> usize {
        self.0.first().map_or(0, Vec::len)
    }

    /// (frames, coefficients)
    pub fn shape(&self) -> (usize, usize) {
        (self.num_frames(), self.num_coefficients())
    }

    pub fn frames(&self) -> &[Vec<f32>] {
        &self.0
    }

    /// Row-major copy of all values
    pub fn flatten(&self) -> Vec<f32> {
        self.0.iter().flatten().copied().collect()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }

    /// Batch of one with an explicit channel axis: [1, 1, frames, coefficients]
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let (frames, coeffs) = self.shape();
        Ok(Tensor::from_vec(self.flatten(), (1, 1, frames, coeffs), device)?)
    }
}

/// MFCC extractor with precomputed window, filterbank and DCT basis
pub struct MfccExtractor {
    config: FeatureConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// [n_mels][n_fft / 2 + 1]
    mel_basis: Vec<Vec<f32>>,
    /// [n_mfcc][n_mels]
    dct_basis: Vec<Vec<f32>>,
}

impl MfccExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);
        let window = hann_window(config.n_fft);
        let mel_basis = slaney_mel_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_mels,
            config.fmin,
            config.fmax(),
        );
        let dct_basis = dct_ortho_basis(config.n_mfcc, config.n_mels);

        Self {
            config,
            fft,
            window,
            mel_basis,
            dct_basis,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extract the feature matrix of a fixed-length clip
    pub fn extract(&self, clip: &NormalizedClip) -> FeatureMatrix {
        FeatureMatrix(self.compute(clip.samples()))
    }

    /// MFCCs of arbitrary-length samples as [frames][n_mfcc]
    pub fn compute(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let power = self.power_spectrogram(samples);
        let mel_db = self.power_to_db(self.apply_mel_filterbank(&power));

        mel_db
            .iter()
            .map(|frame| {
                self.dct_basis
                    .iter()
                    .map(|basis| basis.iter().zip(frame).map(|(b, v)| b * v).sum())
                    .collect()
            })
            .collect()
    }

    /// |STFT|^2 over centered, zero padded frames
    fn power_spectrogram(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let n_fft = self.config.n_fft;
        let hop_length = self.config.hop_length;

        let pad_length = n_fft / 2;
        let mut padded = vec![0.0f32; pad_length];
        padded.extend_from_slice(samples);
        padded.extend(std::iter::repeat(0.0f32).take(pad_length));

        let n_frames = (padded.len() - n_fft) / hop_length + 1;
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];

        (0..n_frames)
            .map(|i| {
                let frame = &padded[i * hop_length..i * hop_length + n_fft];
                for ((slot, &sample), &w) in buffer.iter_mut().zip(frame).zip(&self.window) {
                    *slot = Complex::new(sample * w, 0.0);
                }

                self.fft.process_with_scratch(&mut buffer, &mut scratch);

                buffer[..n_fft / 2 + 1]
                    .iter()
                    .map(|c| c.norm_sqr())
                    .collect()
            })
            .collect()
    }

    fn apply_mel_filterbank(&self, power_spec: &[Vec<f32>]) -> Vec<Vec<f32>> {
        power_spec
            .iter()
            .map(|frame| {
                self.mel_basis
                    .iter()
                    .map(|filter| filter.iter().zip(frame).map(|(f, p)| f * p).sum())
                    .collect()
            })
            .collect()
    }

    /// 10 * log10(S), referenced to 1.0 and floored at `max - top_db`
    fn power_to_db(&self, mel: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
        let mut db: Vec<Vec<f32>> = mel
            .into_iter()
            .map(|frame| {
                frame
                    .into_iter()
                    .map(|v| 10.0 * v.max(AMIN).log10())
                    .collect()
            })
            .collect();

        if let Some(top_db) = self.config.top_db {
            let max = db
                .iter()
                .flatten()
                .copied()
                .fold(f32::NEG_INFINITY, f32::max);
            let floor = max - top_db;
            for v in db.iter_mut().flatten() {
                *v = v.max(floor);
            }
        }

        db
    }
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular filters on the Slaney mel scale, area normalized
fn slaney_mel_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|j| j as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(fmin as f64);
    let mel_max = hz_to_mel(fmax as f64);
    let mel_f: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|i| {
            let (left, center, right) = (mel_f[i], mel_f[i + 1], mel_f[i + 2]);
            let enorm = 2.0 / (right - left);
            fft_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - left) / (center - left);
                    let upper = (right - f) / (right - center);
                    (lower.min(upper).max(0.0) * enorm) as f32
                })
                .collect()
        })
        .collect()
}

/// Rows of the orthonormal DCT-II matrix
fn dct_ortho_basis(n_out: usize, n_in: usize) -> Vec<Vec<f32>> {
    (0..n_out)
        .map(|k| {
            let scale = if k == 0 {
                (1.0 / n_in as f64).sqrt()
            } else {
                (2.0 / n_in as f64).sqrt()
            };
            (0..n_in)
                .map(|n| {
                    (scale * (PI * k as f64 * (2 * n + 1) as f64 / (2 * n_in) as f64).cos()) as f32
                })
                .collect()
        })
        .collect()
}

/// Periodic Hann window
fn hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f64 / length as f64).cos())) as f32)
        .collect()
}
