//! The `orbis` binary: resolve directories, load the config, start logging
//! and open the viewer.

use clap::Parser;
use orbis_app::platform::AppDirs;
use orbis_app::viewer;
use orbis_config::{CliArgs, Config};

fn main() {
    let args = CliArgs::parse();

    let dirs = match AppDirs::resolve(args.config.as_deref()).and_then(|d| {
        d.create_dirs()?;
        Ok(d)
    }) {
        Ok(dirs) => dirs,
        Err(e) => {
            eprintln!("Failed to initialize platform directories: {e}");
            std::process::exit(1);
        }
    };

    let config = match Config::load_or_create(&dirs.config_dir) {
        Ok(mut config) => {
            config.apply_cli_overrides(&args);
            config
        }
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", dirs.config_dir.display());
            std::process::exit(1);
        }
    };

    orbis_log::init_logging(Some(&dirs.log_dir), cfg!(debug_assertions), Some(&config));
    tracing::info!(
        config = %dirs.config_dir.display(),
        logs = %dirs.log_dir.display(),
        "Orbis starting"
    );

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = viewer::run(config) {
        tracing::error!("Viewer failed: {e}");
        std::process::exit(1);
    }
}
