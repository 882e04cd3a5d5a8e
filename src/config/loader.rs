use config::{Config, Environment, File, FileFormat};
use std::path::Path;
use tracing::{debug, info};

use super::runtime::EngineConfig;
use crate::error::{EngineError, Result};

pub const ENV_PREFIX: &str = "ENGINE";

/// Layer built-in defaults, an optional TOML file and `ENGINE__*` environment
/// variables (e.g. `ENGINE__TRAINING__SEED=7`), then validate.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        debug!("Reading configuration from {}", path.display());
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: EngineConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| EngineError::config(e.to_string()))?;

    config
        .validate()
        .map_err(|errors| EngineError::config(errors.join(", ")))?;
    info!(
        "Configuration loaded (store {}, seed {})",
        config.paths.store_root.display(),
        config.training.seed
    );
    Ok(config)
}

/// Effective configuration as TOML.
pub fn render_config(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| EngineError::config(e.to_string()))
}
