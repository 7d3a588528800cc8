//! Audio front end: decoding, resampling, fixed-length clips and MFCCs
//!
//! This module provides:
//! - WAV file I/O with down-mixing to mono
//! - Audio resampling to the system rate
//! - Clip length enforcement (`AudioNormalizer`)
//! - MFCC feature extraction (`MfccExtractor`)

mod io;
mod mfcc;
mod normalize;
pub mod resample;

pub use io::{load_clip, load_wav, save_wav, AudioBuffer};
pub use mfcc::{FeatureMatrix, MfccExtractor};
pub use normalize::{AudioNormalizer, NormalizedClip};
pub use resample::{ResampleQuality, Resampler};
