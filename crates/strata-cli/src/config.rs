//! CLI configuration: a TOML file under the user config directory plus
//! environment and flag overrides.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use strata_db::config::DbConfig;

/// On-disk config file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// Path of the config file: `$XDG_CONFIG_HOME/strata/config.toml`.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
        .join("config.toml")
}

/// Write the config file, creating parent directories as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(config).context("failed to render config")?;
    fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Load the config file if it exists.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    pub db_config: DbConfig,
}

impl StrataConfig {
    /// Resolve the database URL with the usual precedence:
    /// CLI flag > `STRATA_DATABASE_URL` env var > config file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        if let Some(url) = cli_db_url {
            return Ok(Self {
                db_config: DbConfig::new(url),
            });
        }

        if let Ok(url) = std::env::var("STRATA_DATABASE_URL") {
            return Ok(Self {
                db_config: DbConfig::new(url),
            });
        }

        if let Some(file) = load_config()? {
            return Ok(Self {
                db_config: DbConfig::new(file.database.url),
            });
        }

        Ok(Self {
            db_config: DbConfig::new(DbConfig::DEFAULT_URL),
        })
    }
}
