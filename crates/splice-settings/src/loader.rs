//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/splice/splice.toml`
//! 2. Project: `<workspace>/.splice/splice.toml`
//!
//! Project values take precedence; see [`SpliceConfig::merge`].

use crate::{SettingsError, SpliceConfig};
use std::path::{Path, PathBuf};

/// Loads and merges `SpliceConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Missing files are skipped.
    ///
    /// # Errors
    /// Returns the first read or parse error from a file that exists.
    pub fn load(workspace: &Path) -> Result<SpliceConfig, SettingsError> {
        let global = match Self::global_config_path() {
            Some(path) => Self::load_optional(&path)?,
            None => SpliceConfig::default(),
        };
        let project = Self::load_optional(&Self::project_config_path(workspace))?;
        Ok(global.merge(project))
    }

    /// Absolute path to the global config file, if a config directory exists.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("splice").join("splice.toml"))
    }

    /// Path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".splice").join("splice.toml")
    }

    fn load_optional(path: &Path) -> Result<SpliceConfig, SettingsError> {
        if !path.exists() {
            return Ok(SpliceConfig::default());
        }
        SpliceConfig::load(path)
    }
}
