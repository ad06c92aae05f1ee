//! CLI configuration file.
//!
//! ```toml
//! [container]
//! kind = "relational"
//! path = "data/game.db"
//!
//! [container.table]
//! name = "players"
//! columns = [
//!     { name = "id", type = "string" },
//!     { name = "score", type = "long" },
//! ]
//!
//! [settings]
//! lockTimeoutMillis = 2000
//! retryAttempts = 5
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use stowage_store::{ContainerConfig, StorageSettings};

/// Contents of `stowage.toml`.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    pub container: ContainerConfig,
    #[serde(default)]
    pub settings: StorageSettings,
}

impl CliConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid stowage configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

// ── tests ────────────────────────────────────────────────────────────
