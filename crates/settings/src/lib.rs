//! CacheCraft Settings
//!
//! Configuration for the client daemon: repository location, network
//! ports, the cache's signing key tag, bootstrap nodes. JSON on disk under
//! the repository root, with serde defaults so old files keep loading as
//! fields are added.

mod config;

pub use config::{Settings, DEFAULT_CACHE_CAPACITY, DEFAULT_BOOTSTRAP_NODES};

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Read(std::io::Error),

    #[error("Failed to write settings: {0}")]
    Write(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(serde_json::Error),

    #[error("Failed to create repository directory: {0}")]
    CreateDir(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// The settings file path inside a repository.
pub fn settings_path(repo: &Path) -> PathBuf {
    repo.join("settings.json")
}
