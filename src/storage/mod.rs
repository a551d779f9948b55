//! Persistent storage
//!
//! Settings and session files under the platform data directory.

use std::path::{Path, PathBuf};
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
    #[error("Invalid session name: {0:?}")]
    InvalidSessionName(String),
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\llama-predict\llama-predict`
/// - macOS: `/Users/{user}/Library/Application Support/org.llama-predict.llama-predict`
/// - Linux: `/home/{user}/.local/share/llama-predict`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("org", "llama-predict", "llama-predict")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Directory holding session files
pub fn sessions_dir() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("sessions"))
}

/// Session file path for a named conversation inside `dir`
pub fn session_path_in(dir: &Path, name: &str) -> Result<PathBuf, StorageError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if !valid {
        return Err(StorageError::InvalidSessionName(name.to_string()));
    }
    Ok(dir.join(format!("{name}.session")))
}

/// Default session file path for a named conversation
pub fn default_session_path(name: &str) -> Result<PathBuf, StorageError> {
    session_path_in(&sessions_dir()?, name)
}

/// Creates the data directory and its `sessions/` subdirectory
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(data_dir.join("sessions"))?;
    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(data_dir)
}
