//! Persistent storage
//!
//! This module handles persistence of generation settings.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\llmstream\llmstream`
/// - macOS: `/Users/{user}/Library/Application Support/dev.llmstream.llmstream`
/// - Linux: `/home/{user}/.local/share/llmstream`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("dev", "llmstream", "llmstream")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Creates the data directory and its default `models/` folder
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(data_dir.join("models"))?;

    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(data_dir)
}
