//! Layered TOML configuration for the splice relay.
//!
//! Configuration is read from two locations:
//! - Global config: `~/.config/splice/splice.toml`
//! - Project config: `<workspace>/.splice/splice.toml`
//!
//! Project values take precedence for scalar fields; the `[filter.config]`
//! table is merged key by key.
//!
//! # Example
//!
//! ```no_run
//! use splice_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new(".")).unwrap();
//! println!("{:?}", config.listener.bind_addr);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Filter name used when a config does not pick one.
pub const DEFAULT_FILTER_NAME: &str = "relay";

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A required key was not set by any config layer.
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// TOML `[listener]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerSettings {
    /// Address to accept client connections on (e.g. `127.0.0.1:10000`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// Maximum concurrent client connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

/// TOML `[upstream]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    /// Upstream connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

/// TOML `[filter]` section.
///
/// `config` is handed to the named filter's config factory untouched; the
/// filter validates its own keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSettings {
    /// Registered filter name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Filter-specific configuration table.
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub config: toml::Table,
}

/// Top-level splice configuration, corresponding to `splice.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpliceConfig {
    /// Listener configuration.
    #[serde(default)]
    pub listener: ListenerSettings,

    /// Upstream connection configuration.
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Filter selection and its configuration.
    #[serde(default)]
    pub filter: FilterSettings,
}

impl SpliceConfig {
    /// Parse a `SpliceConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `SpliceConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// - Scalar fields: `other` wins when explicitly set (`Some`).
    /// - `filter.config`: merged key by key with `other`'s keys winning,
    ///   unless `other` names a different filter, in which case its table
    ///   replaces ours outright.
    #[must_use]
    pub fn merge(mut self, other: SpliceConfig) -> SpliceConfig {
        if other.listener.bind_addr.is_some() {
            self.listener.bind_addr = other.listener.bind_addr;
        }
        if other.listener.max_connections.is_some() {
            self.listener.max_connections = other.listener.max_connections;
        }
        if other.upstream.connect_timeout_secs.is_some() {
            self.upstream.connect_timeout_secs = other.upstream.connect_timeout_secs;
        }

        let switches_filter = match (&self.filter.name, &other.filter.name) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        };
        if switches_filter {
            self.filter.config = other.filter.config;
        } else {
            self.filter.config.extend(other.filter.config);
        }
        if other.filter.name.is_some() {
            self.filter.name = other.filter.name;
        }
        self
    }

    /// The configured filter name.
    ///
    /// # Errors
    /// Returns `SettingsError::Missing` if no layer set `filter.name`.
    pub fn filter_name(&self) -> Result<&str, SettingsError> {
        self.filter
            .name
            .as_deref()
            .ok_or(SettingsError::Missing("filter.name"))
    }

    /// A starter config for `splice config init`.
    pub fn starter() -> Self {
        let mut config = toml::Table::new();
        config.insert("server_addr".to_string(), "127.0.0.1".into());
        config.insert("server_port".to_string(), "9000".into());
        Self {
            listener: ListenerSettings {
                bind_addr: Some("127.0.0.1:10000".to_string()),
                max_connections: Some(1000),
            },
            upstream: UpstreamSettings {
                connect_timeout_secs: Some(30),
            },
            filter: FilterSettings {
                name: Some(DEFAULT_FILTER_NAME.to_string()),
                config,
            },
        }
    }
}
