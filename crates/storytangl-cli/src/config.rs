// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! `stconfig.json`: the per-OS-config-dir settings file this CLI reads its
//! defaults from, with `STORYTANGL_*` environment variables layered on top.
//!
//! Mirrors `echo-config-fs::FsConfigStore`'s "platform config dir, JSON
//! file per key" convention, collapsed to the single key this CLI needs.

use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

/// Defaults `stcli` falls back to when a subcommand's flags don't override
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default `sled` database path for the patch log / snapshot store.
    pub store_path: PathBuf,
    /// Default subroutine recursion limit (spec.md §4.6, default 64).
    pub max_call_depth: u32,
    /// Whether `POSTREQS` runs the opt-in softlock check by default
    /// (spec.md §9 Open Question: kept opt-in for fixtures relying on dead
    /// ends).
    pub softlock_check: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            max_call_depth: 64,
            softlock_check: false,
        }
    }
}

fn default_store_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("stcli.sled"),
        |dirs| dirs.data_dir().join("stcli.sled"),
    )
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "flyingrobots", "StoryTangl")
}

fn config_file_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("stconfig.json"))
}

impl EngineConfig {
    /// Loads `stconfig.json` from the platform config directory (an absent
    /// file is not an error — defaults apply), then layers `STORYTANGL_*`
    /// environment overrides on top.
    ///
    /// # Errors
    /// [`CliError::Io`] if the file exists but cannot be read;
    /// [`CliError::Codec`] if its contents are not valid JSON.
    pub fn load() -> Result<Self, CliError> {
        let mut config = match config_file_path() {
            Some(path) if path.exists() => {
                let text = fs::read_to_string(&path)?;
                serde_json::from_str(&text).map_err(|e| CliError::Codec(e.to_string()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Persists this configuration to `stconfig.json`, creating the
    /// platform config directory if needed.
    ///
    /// # Errors
    /// [`CliError::Io`] if the directory or file cannot be written;
    /// [`CliError::Codec`] if serialization fails (never, in practice).
    pub fn save(&self) -> Result<(), CliError> {
        let Some(path) = config_file_path() else {
            return Err(CliError::Io(std::io::Error::other(
                "could not resolve a platform config directory",
            )));
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| CliError::Codec(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STORYTANGL_STORE_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Ok(depth) = std::env::var("STORYTANGL_MAX_CALL_DEPTH") {
            if let Ok(depth) = depth.parse() {
                self.max_call_depth = depth;
            }
        }
        if let Ok(flag) = std::env::var("STORYTANGL_SOFTLOCK_CHECK") {
            self.softlock_check = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_the_spec_default_call_depth() {
        assert_eq!(EngineConfig::default().max_call_depth, 64);
    }

    #[test]
    fn env_override_replaces_the_store_path() {
        std::env::set_var("STORYTANGL_STORE_PATH", "/tmp/example.sled");
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.store_path, PathBuf::from("/tmp/example.sled"));
        std::env::remove_var("STORYTANGL_STORE_PATH");
    }
}
