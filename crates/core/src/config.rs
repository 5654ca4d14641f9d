//! Trust-policy configuration with layered loading.
//!
//! Loading precedence (highest wins):
//!
//! 1. Environment variables (FETCHGUARD_*)
//! 2. TOML config file (if FETCHGUARD_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

/// Trust-policy subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Path of the HSTS cache file. Unset disables persistence for the
    /// HSTS store.
    ///
    /// Set via FETCHGUARD_HSTS_FILE environment variable.
    #[serde(default)]
    pub hsts_file: Option<PathBuf>,

    /// Path of the HPKP cache file. Unset disables persistence for the
    /// pin store.
    ///
    /// Set via FETCHGUARD_HPKP_FILE environment variable.
    #[serde(default)]
    pub hpkp_file: Option<PathBuf>,

    /// Whether learned HSTS policies upgrade plain connections.
    ///
    /// Set via FETCHGUARD_ENFORCE_HSTS environment variable.
    #[serde(default = "default_true")]
    pub enforce_hsts: bool,

    /// Whether presented public keys are checked against stored pins.
    ///
    /// Set via FETCHGUARD_ENFORCE_PINS environment variable.
    #[serde(default = "default_true")]
    pub enforce_pins: bool,

    /// Directories searched for loadable trust-store modules.
    ///
    /// Set via FETCHGUARD_PLUGIN_DIRS environment variable
    /// (comma-separated).
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            hsts_file: None,
            hpkp_file: None,
            enforce_hsts: true,
            enforce_pins: true,
            plugin_dirs: Vec::new(),
        }
    }
}

impl TrustConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a source cannot be read or parsed, or
    /// if validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("FETCHGUARD_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("FETCHGUARD_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if both caches point at the same
    /// backing file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(hsts), Some(hpkp)) = (&self.hsts_file, &self.hpkp_file) {
            if hsts == hpkp {
                return Err(ConfigError::Invalid {
                    field: "hpkp_file".into(),
                    reason: "must differ from hsts_file".into(),
                });
            }
        }
        Ok(())
    }
}
