mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

impl ProxyConfig {
    /// Load the proxy configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ProxyConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

impl RouteFile {
    /// Load route definitions from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read route file {}", path.display()))?;
        let file: RouteFile = toml::from_str(&raw)
            .with_context(|| format!("failed to parse route file {}", path.display()))?;
        Ok(file)
    }
}
