//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use orbis_math::TileProjection;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level viewer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub planet: PlanetConfig,
    /// Tile refinement and resource limits.
    pub quadtree: QuadTreeConfig,
    pub camera: CameraConfig,
    /// Imagery layers created at startup, in registration order.
    pub layers: Vec<LayerConfig>,
    pub debug: DebugConfig,
}

/// Window configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Window width in logical pixels.
    pub width: u32,
    /// Window height in logical pixels.
    pub height: u32,
    pub fullscreen: bool,
    /// Enable vsync (PresentMode::Fifo).
    pub vsync: bool,
    pub title: String,
}

/// Reference ellipsoid and tiling scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanetConfig {
    /// Semi-major (equatorial) axis in meters.
    pub semi_major_axis_m: f64,
    /// Semi-minor (polar) axis in meters.
    pub semi_minor_axis_m: f64,
    pub projection: TileProjection,
    /// Multiplier applied to terrain heights.
    pub height_factor: f64,
}

/// Quadtree refinement settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuadTreeConfig {
    /// Deepest level a node may be refined to (root is 0).
    pub max_depth: u8,
    /// Projected bounding-sphere size, in pixels, above which a node splits.
    pub refine_threshold_px: f64,
    /// Fraction below the refine threshold at which a node merges again.
    pub hysteresis: f64,
    /// Grid cells per segment side. Must be a power of two up to 32.
    pub grid_size: u32,
    /// Cap on live segments; `None` leaves the count to the thresholds.
    pub max_segments: Option<usize>,
    /// Height margin added to bounding spheres, in meters.
    pub terrain_margin_m: f64,
}

/// Orbit camera settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Vertical field of view in degrees.
    pub fov_degrees: f64,
    pub start_altitude_m: f64,
    pub start_lon_deg: f64,
    pub start_lat_deg: f64,
    /// Angular orbit speed in degrees per second at the start altitude.
    pub orbit_speed_deg_s: f64,
    /// Fraction of the current altitude covered per second when zooming.
    pub zoom_rate: f64,
}

/// Procedural imagery source for a configured layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LayerSource {
    Checkerboard,
    Gradient,
    /// Tile outlines with a depth-coloured border.
    TileGrid,
}

/// One imagery layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayerConfig {
    pub name: String,
    pub source: LayerSource,
    pub visible: bool,
    pub opacity: f32,
    pub z_index: i32,
    /// Whether this layer is the base layer.
    pub base: bool,
    /// RGB tint multiplied into the layer's texels.
    pub tint: [f32; 3],
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Blit the picking buffer to the screen instead of the globe.
    pub show_picking_buffer: bool,
}

// --- Default implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            planet: PlanetConfig::default(),
            quadtree: QuadTreeConfig::default(),
            camera: CameraConfig::default(),
            layers: vec![
                LayerConfig {
                    name: "checkerboard".to_string(),
                    source: LayerSource::Checkerboard,
                    base: true,
                    ..LayerConfig::default()
                },
                LayerConfig {
                    name: "tile-grid".to_string(),
                    source: LayerSource::TileGrid,
                    opacity: 0.6,
                    z_index: 1,
                    ..LayerConfig::default()
                },
            ],
            debug: DebugConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fullscreen: false,
            vsync: true,
            title: "Orbis".to_string(),
        }
    }
}

impl Default for PlanetConfig {
    fn default() -> Self {
        Self {
            semi_major_axis_m: 6_378_137.0,
            semi_minor_axis_m: 6_356_752.314_245,
            projection: TileProjection::WebMercator,
            height_factor: 1.0,
        }
    }
}

impl Default for QuadTreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 17,
            refine_threshold_px: 256.0,
            hysteresis: 0.25,
            grid_size: 16,
            max_segments: None,
            terrain_margin_m: 0.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: 45.0,
            start_altitude_m: 20_000_000.0,
            start_lon_deg: 0.0,
            start_lat_deg: 20.0,
            orbit_speed_deg_s: 30.0,
            zoom_rate: 1.0,
        }
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: LayerSource::Gradient,
            visible: true,
            opacity: 1.0,
            z_index: 0,
            base: false,
            tint: [1.0, 1.0, 1.0],
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            show_picking_buffer: false,
        }
    }
}

// --- Validation ---

impl QuadTreeConfig {
    /// Check ranges the quadtree relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hysteresis > 0.0 && self.hysteresis < 1.0) {
            return Err(ConfigError::Invalid {
                field: "quadtree.hysteresis",
                reason: format!("{} is not inside (0, 1)", self.hysteresis),
            });
        }
        if !(self.refine_threshold_px.is_finite() && self.refine_threshold_px > 0.0) {
            return Err(ConfigError::Invalid {
                field: "quadtree.refine_threshold_px",
                reason: format!("{} must be positive", self.refine_threshold_px),
            });
        }
        if !self.grid_size.is_power_of_two() || self.grid_size > 32 {
            return Err(ConfigError::Invalid {
                field: "quadtree.grid_size",
                reason: format!("{} is not a power of two in 1..=32", self.grid_size),
            });
        }
        Ok(())
    }
}

impl Config {
    /// Validate every section that has constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quadtree.validate()?;
        if !(self.planet.semi_minor_axis_m > 0.0
            && self.planet.semi_major_axis_m >= self.planet.semi_minor_axis_m)
        {
            return Err(ConfigError::Invalid {
                field: "planet",
                reason: "requires semi_major_axis_m >= semi_minor_axis_m > 0".to_string(),
            });
        }
        if self.layers.iter().filter(|l| l.base).count() > 1 {
            log::warn!("More than one base layer configured; the last one wins");
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file; `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("width: 1280"));
        assert!(ron_str.contains("max_depth: 17"));
        assert!(ron_str.contains("WebMercator"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(window: (), planet: (projection: Geographic))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.quadtree, QuadTreeConfig::default());
        assert_eq!(config.planet.projection, TileProjection::Geographic);
        assert_eq!(config.planet.height_factor, 1.0);
    }

    #[test]
    fn test_partial_layer_uses_defaults() {
        let ron_str = r#"(layers: [(name: "osm", base: true)])"#;
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.layers.len(), 1);
        assert_eq!(config.layers[0].name, "osm");
        assert!(config.layers[0].visible);
        assert_eq!(config.layers[0].tint, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_max_segments_optional() {
        let config: Config = ron::from_str("(quadtree: (max_segments: Some(64)))").unwrap();
        assert_eq!(config.quadtree.max_segments, Some(64));
        assert_eq!(Config::default().quadtree.max_segments, None);
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_hysteresis() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.quadtree.hysteresis = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "quadtree.hysteresis", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_grid_size() {
        let mut config = Config::default();
        config.quadtree.grid_size = 24;
        assert!(config.validate().is_err());
        config.quadtree.grid_size = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.window.width = 1920;
        config.quadtree.max_depth = 12;
        config.layers[1].tint = [1.0, 0.5, 0.0];

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.camera.fov_degrees = 60.0;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.map(|c| c.camera.fov_degrees), Some(60.0));
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
