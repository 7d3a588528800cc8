//! In-process inference service
//!
//! The service starts uninitialized and loads the model on the first
//! prediction (or on an explicit [`KeywordSpottingService::initialize`]).
//! Loading happens at most once: concurrent first callers serialize on an
//! init lock and all of them observe the same loaded model afterwards.
//! There is no global instance; share the service by wrapping it in an
//! `Arc` and passing the handle around.

use anyhow::Result;
use candle_core::Device;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use crate::config::KwsConfig;
use crate::{KeywordSpotter, Prediction};

pub struct KeywordSpottingService {
    config: KwsConfig,
    device: Device,
    spotter: OnceLock<KeywordSpotter>,
    init_lock: Mutex<()>,
}

impl KeywordSpottingService {
    /// Create an uninitialized service; nothing is read from disk yet
    pub fn new(config: KwsConfig, device: Device) -> Self {
        Self {
            config,
            device,
            spotter: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &KwsConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.spotter.get().is_some()
    }

    /// Load the model now instead of on the first prediction
    pub fn initialize(&self) -> Result<&KeywordSpotter> {
        if let Some(spotter) = self.spotter.get() {
            return Ok(spotter);
        }

        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("service init lock poisoned"))?;

        // Another caller may have finished loading while we waited
        if let Some(spotter) = self.spotter.get() {
            return Ok(spotter);
        }

        tracing::info!(
            "Initializing keyword spotting service from {}",
            self.config.model_path.display()
        );
        let spotter = KeywordSpotter::load(&self.config, self.device.clone())?;
        Ok(self.spotter.get_or_init(|| spotter))
    }

    /// Classify the audio file at `path`
    pub fn predict<P: AsRef<Path>>(&self, path: P) -> Result<Prediction> {
        self.initialize()?.predict(path)
    }

    /// Classify an in-memory waveform
    pub fn predict_samples(&self, samples: &[f32], sample_rate: u32) -> Result<Prediction> {
        self.initialize()?.predict_samples(samples, sample_rate)
    }
}
