//! Builder configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::DEFAULT_UNDO_LIMIT;
use crate::domain::DEFAULT_APP_NAME;

/// Prefix of environment variables overriding configuration values.
pub const ENV_PREFIX: &str = "PAGECRAFT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Builder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Directory of the file-backed key-value store.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Namespace of every persisted key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Name of the app seeded into empty storage.
    #[serde(default = "default_app_name")]
    pub default_app_name: String,

    /// Number of snapshots kept for undo.
    #[serde(default = "default_undo_limit")]
    pub undo_limit: usize,

    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".pagecraft")
}

fn default_key_prefix() -> String {
    "pagecraft".to_string()
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn default_undo_limit() -> usize {
    DEFAULT_UNDO_LIMIT
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            key_prefix: default_key_prefix(),
            default_app_name: default_app_name(),
            undo_limit: default_undo_limit(),
            log_filter: default_log_filter(),
        }
    }
}

impl BuilderConfig {
    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `PAGECRAFT_*` variables from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by variable name, e.g. `PAGECRAFT_UNDO_LIMIT`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

        if let Some(dir) = var("STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = var("KEY_PREFIX") {
            self.key_prefix = prefix;
        }
        if let Some(name) = var("DEFAULT_APP_NAME") {
            self.default_app_name = name;
        }
        if let Some(limit) = var("UNDO_LIMIT") {
            self.undo_limit = limit.trim().parse().map_err(|e| ConfigError::Invalid {
                key: format!("{ENV_PREFIX}UNDO_LIMIT"),
                message: format!("{e}"),
            })?;
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.log_filter = filter;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.trim().is_empty() || self.key_prefix.contains(':') {
            return Err(ConfigError::Invalid {
                key: "key_prefix".to_string(),
                message: "must be non-empty and must not contain ':'".to_string(),
            });
        }
        if self.default_app_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "default_app_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
