//! Settings storage
//!
//! Manages persistence of generation settings.

use crate::inference::batch::{TokenId, MAX_STEP_WIDTH};
use crate::inference::stop::StopPolicy;
use crate::inference::worker::GenerationParams;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_TOKENS: u32 = 256;
const DEFAULT_CONTEXT_SIZE: u32 = 2048;
const DEFAULT_THREADS: u32 = 4;

/// Generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Widest prompt chunk per decode call
    pub batch_size: u32,
    /// Threads for generation and prompt processing
    pub threads: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Prepend the BOS token to prompts
    pub add_bos: bool,
    /// Role labels that end the response when they start a new line
    pub role_markers: Vec<String>,
    /// Vocabulary-specific token ids that end the response
    pub stop_token_ids: Vec<TokenId>,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_size: MAX_STEP_WIDTH as u32,
            threads: DEFAULT_THREADS,
            gpu_layers: 0,
            add_bos: true,
            role_markers: vec!["User".to_string()],
            stop_token_ids: Vec::new(),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
        }
    }
}

impl GenerationSettings {
    /// Validate settings values
    ///
    /// Zero sizes fall back to defaults, blank role markers are dropped.
    pub fn validate(&mut self) {
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }

        if self.context_size == 0 {
            self.context_size = DEFAULT_CONTEXT_SIZE;
        }

        if self.batch_size == 0 {
            self.batch_size = MAX_STEP_WIDTH as u32;
        }
        self.batch_size = self.batch_size.min(self.context_size);

        if self.threads == 0 {
            self.threads = DEFAULT_THREADS;
        }

        self.role_markers.retain(|m| !m.trim().is_empty());
    }

    /// Stop rules for the controller
    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy::new(self.role_markers.clone(), self.stop_token_ids.clone())
    }

    /// Parameters for one generation request
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: self.threads,
            add_bos: self.add_bos,
            stop_policy: self.stop_policy(),
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the data directory
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> GenerationSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            GenerationSettings::default()
        }
    }
}

/// Load settings from `path`; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<GenerationSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(GenerationSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: GenerationSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &GenerationSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

/// Save settings to `path`, creating parent directories
pub fn save_settings_to(path: &Path, settings: &GenerationSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = GenerationSettings::default();
        assert_eq!(settings.max_tokens, 256);
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.batch_size, 512);
        assert_eq!(settings.role_markers, vec!["User".to_string()]);
        assert!(settings.add_bos);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = GenerationSettings {
            max_tokens: 0,
            context_size: 256,
            batch_size: 0,
            threads: 0,
            role_markers: vec!["User".to_string(), " ".to_string()],
            ..GenerationSettings::default()
        };
        settings.validate();

        assert_eq!(settings.max_tokens, 256);
        assert_eq!(settings.batch_size, 256);
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.role_markers, vec!["User".to_string()]);
    }

    #[test]
    fn test_generation_params() {
        let settings = GenerationSettings {
            max_tokens: 64,
            stop_token_ids: vec![13],
            ..GenerationSettings::default()
        };
        let params = settings.generation_params();
        assert_eq!(params.max_tokens, 64);
        assert!(params.stop_policy.is_stop_token(13));
        assert!(params.stop_policy.is_role_switch(b"User"));
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = GenerationSettings {
            max_tokens: 99,
            gpu_layers: 12,
            ..GenerationSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, GenerationSettings::default());
    }

    #[test]
    fn test_partial_file_is_filled_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "max_tokens": 32, "context_size": 0 }"#).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.max_tokens, 32);
        assert_eq!(loaded.context_size, 2048);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }
}
