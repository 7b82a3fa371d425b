//! Runtime settings for the binary: a TOML file with `[server]`, `[client]` and `[processing]`
//! sections, each optional, then environment overrides on top.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 2575
//!
//! [processing]
//! mapping_file = "mappings/adt.json"
//! log_level = "debug"
//! ```

use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::client::ClientConfig;
use crate::error::ConfigError;
use crate::server::ServerConfig;

pub const ENV_BIND: &str = "HL7_PROCESSOR_BIND";
pub const ENV_PORT: &str = "HL7_PROCESSOR_PORT";
pub const ENV_MAPPING: &str = "HL7_PROCESSOR_MAPPING";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Field mapping configuration (JSON or TOML); without one messages are stored untransformed
    pub mapping_file: Option<PathBuf>,
    /// Used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        ProcessingSettings {
            mapping_file: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub processing: ProcessingSettings,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Settings, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads `path` when given, otherwise starts from defaults, then applies the environment.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                debug!("Loading settings from {}", path.display());
                Settings::from_toml_str(&std::fs::read_to_string(path)?)?
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind_address = bind;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} is not a port number: '{}'", ENV_PORT, port)))?;
        }
        if let Some(mapping) = lookup(ENV_MAPPING) {
            self.processing.mapping_file = Some(PathBuf::from(mapping));
        }
        Ok(())
    }
}
