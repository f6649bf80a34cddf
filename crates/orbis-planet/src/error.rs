//! Planet error types.

use orbis_config::ConfigError;
use orbis_math::MathError;
use orbis_render::GpuError;

/// Failures surfaced by [`Planet`](crate::Planet) to the application.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanetError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("invalid planet shape: {0}")]
    Math(#[from] MathError),

    #[error("invalid config value `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// `frame` or `pick` called before `init`.
    #[error("planet `{0}` is not initialized")]
    NotInitialized(String),
}

impl From<ConfigError> for PlanetError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid { field, reason } => PlanetError::InvalidConfig { field, reason },
            other => PlanetError::InvalidConfig {
                field: "config",
                reason: other.to_string(),
            },
        }
    }
}
