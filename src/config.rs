//! Runtime configuration for a Colombo bus.
//!
//! Stored as TOML, by default at `~/.colombo/config.toml`. Every field has a
//! default, so an empty or missing file yields a working configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageContext;

/// Errors loading or validating a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("failed to read config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("failed to parse config from {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The values are well-formed but inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ColomboConfig {
    pub logging: LoggingConfig,
    pub send: SendConfig,
    pub stateful: StatefulConfig,
    pub context: ContextConfig,
    /// Remote processors; each needs a transport registered under its name.
    pub remote: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SendConfig {
    /// SLA applied to requests that declare none, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatefulConfig {
    /// Batches a stateful bus may send before refusing
    pub max_allowed_sends: usize,
}

impl Default for StatefulConfig {
    fn default() -> Self {
        Self {
            max_allowed_sends: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Values filled into requests whose context lacks the key
    pub defaults: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteConfig {
    pub name: String,
    /// Request group names this remote processor claims
    pub groups: Vec<String>,
}

impl ColomboConfig {
    /// `~/.colombo/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".colombo").join("config.toml"))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load the config at `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stateful.max_allowed_sends == 0 {
            return Err(ConfigError::Invalid(
                "stateful.max_allowed_sends must be at least 1".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for remote in &self.remote {
            if !names.insert(remote.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "remote `{}` is declared more than once",
                    remote.name
                )));
            }
            if remote.groups.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "remote `{}` claims no group",
                    remote.name
                )));
            }
        }
        Ok(())
    }

    pub fn default_sla(&self) -> Option<Duration> {
        self.send.sla_ms.map(Duration::from_millis)
    }

    pub fn context_defaults(&self) -> MessageContext {
        self.context
            .defaults
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }
}
