//! Configuration for the Orbis globe viewer.
//!
//! Settings persist to disk as RON, every section falls back to defaults when
//! missing, and command-line flags override whatever was loaded.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CameraConfig, Config, DebugConfig, LayerConfig, LayerSource, PlanetConfig, QuadTreeConfig,
    WindowConfig,
};
pub use error::ConfigError;

/// Default configuration directory: `<platform config dir>/orbis`.
pub fn default_config_dir() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("orbis"))
}
