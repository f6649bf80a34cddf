//! Where the viewer keeps its config and logs.

use std::io;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "orbis";

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("could not determine OS configuration directory")]
    NoConfigDir,

    #[error("platform I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-user directories of the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    /// Holds `config.ron`.
    pub config_dir: PathBuf,
    /// Holds the JSON log of debug builds.
    pub log_dir: PathBuf,
}

impl AppDirs {
    /// Platform directories, with the config directory replaced by
    /// `config_override` when given.
    pub fn resolve(config_override: Option<&Path>) -> Result<Self, PlatformError> {
        let config_dir = match config_override {
            Some(dir) => dir.to_path_buf(),
            None => orbis_config::default_config_dir().ok_or(PlatformError::NoConfigDir)?,
        };
        let log_dir = dirs::data_local_dir()
            .map(|d| d.join(APP_NAME).join("logs"))
            .unwrap_or_else(|| config_dir.join("logs"));
        Ok(Self {
            config_dir,
            log_dir,
        })
    }

    /// Everything under one root, for tests and portable installs.
    pub fn with_root(root: &Path) -> Self {
        let app_dir = root.join(APP_NAME);
        Self {
            config_dir: app_dir.join("config"),
            log_dir: app_dir.join("logs"),
        }
    }

    pub fn create_dirs(&self) -> Result<(), PlatformError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
