//! Loading of the core configuration from TOML.

use std::path::Path;

use anyhow::{Context, Result};
use oxmedia_core::CoreConfig;

/// Read and validate the configuration at `path`, or the defaults when no
/// file was given.
pub fn load(path: Option<&Path>) -> Result<CoreConfig> {
    let Some(path) = path else {
        return Ok(CoreConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config = parse(&contents).with_context(|| format!("Invalid config: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn parse(contents: &str) -> Result<CoreConfig> {
    let config: CoreConfig = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}
