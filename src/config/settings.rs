use crate::config::models::SamplingDefaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::error;

/// App-wide sampling fallbacks, used when neither the request nor the
/// model config pins a value.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
#[serde(default)]
pub struct SamplingSettings {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self { temperature: 0.8, top_k: 50, top_p: 0.8, repetition_penalty: 1.01 }
    }
}

/// Fully resolved sampler knobs handed to the generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl SamplingSettings {
    /// Fallback chain: request override, then model default, then app
    /// setting.
    pub fn resolve(&self, model: &SamplingDefaults, request: &SamplingDefaults) -> SamplingParams {
        SamplingParams {
            temperature: request
                .temperature
                .or(model.temperature)
                .unwrap_or(self.temperature),
            top_k: request.top_k.or(model.top_k).unwrap_or(self.top_k),
            top_p: request.top_p.or(model.top_p).unwrap_or(self.top_p),
            repetition_penalty: request
                .repetition_penalty
                .or(model.repetition_penalty)
                .unwrap_or(self.repetition_penalty),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppSettings {
    pub sampling: SamplingSettings,
    /// Prompt ingestion chunk, in tokens, when a model config does not set
    /// its own.
    pub chunk_size: u32,
    /// Per-device memory, in MiB, reported by the simulated backend when
    /// no accelerator stack is present.
    pub sim_device_mib: Vec<u64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            sampling: SamplingSettings::default(),
            chunk_size: 2048,
            sim_device_mib: vec![24576],
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error reading settings: {0}")]
    Confy(#[from] confy::ConfyError),
}

impl AppSettings {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<AppSettings> {
        match AppSettings::load_or_create(path) {
            Err(SettingsError::Confy(message, ..)) => {
                error!("Failed to load settings: {}", message);
                None
            }
            Err(SettingsError::Io(message, ..)) => {
                error!("Failed to load settings: {}", message);
                None
            }
            Ok(settings) => Some(settings),
        }
    }

    fn load_or_create<P: AsRef<Path>>(path: P) -> Result<AppSettings, SettingsError> {
        let path = path.as_ref();

        if path.exists() {
            let settings: Self = confy::load_path(path)?;
            Ok(settings)
        } else {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let settings = AppSettings::default();
            confy::store_path(path, &settings)?;
            Ok(settings)
        }
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        confy::store_path(path, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yml");
        let settings = AppSettings::from_path(&path).unwrap();
        assert_eq!(settings.chunk_size, 2048);
        assert!(path.exists(), "defaults written on first load");

        let reloaded = AppSettings::from_path(&path).unwrap();
        assert_eq!(reloaded.sampling, settings.sampling);
    }

    #[test]
    fn test_resolve_fallback_chain() {
        let settings = SamplingSettings::default();
        let model = SamplingDefaults { temperature: Some(0.6), top_k: Some(20), ..Default::default() };
        let request = SamplingDefaults { temperature: Some(1.2), ..Default::default() };

        let resolved = settings.resolve(&model, &request);
        assert_eq!(resolved.temperature, 1.2, "request wins");
        assert_eq!(resolved.top_k, 20, "model fills the gap");
        assert_eq!(resolved.top_p, 0.8, "app default last");
        assert_eq!(resolved.repetition_penalty, 1.01);
    }
}
