// Spytrace - Line-level execution tracer
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tracer configuration.
//!
//! A configuration file is plain TOML:
//!
//! ```toml
//! fallback = "type_name"
//! cooperate = false
//! source_root = "/path/to/workspace"
//! ignored_files = ["src/generated.rs"]
//!
//! [fields]
//! event = true
//! arg = true
//! frame = { lineno = true, locals = true, code = { filename = true } }
//! ```

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use spytrace_common::{
    env::{SPYTRACE_CONFIG, SPYTRACE_SOURCE_ROOT},
    FieldMask,
};
use tracing::debug;

use crate::{write_atomic, Fallback};

/// Settings for a [`crate::Tracer`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Substitute for values that cannot be serialized
    pub fallback: Fallback,
    /// Forward events to the hook that was installed before tracing started
    pub cooperate: bool,
    /// Directory that relative source file names are resolved against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_root: Option<PathBuf>,
    /// Source files whose events are never recorded, besides the engine's own
    pub ignored_files: Vec<String>,
    /// Attributes captured for every event
    pub fields: FieldMask,
}

impl TracerConfig {
    /// Default location of the configuration file, `~/.spytrace.toml`
    pub fn config_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| eyre::eyre!("Unable to determine home directory"))?;
        Ok(home.join(".spytrace.toml"))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {path:?}"))?;

        debug!("Loaded tracer configuration from {:?}", path);
        Ok(config)
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).with_context(|| "Failed to parse config as TOML")?;
        config.fields.validate()?;
        Ok(config)
    }

    /// Configuration from the environment.
    ///
    /// Loads the file named by `SPYTRACE_CONFIG`, else `~/.spytrace.toml` when it exists,
    /// else the defaults. `SPYTRACE_SOURCE_ROOT` overrides the source root.
    pub fn from_env() -> Result<Self> {
        let explicit = env::var_os(SPYTRACE_CONFIG).map(PathBuf::from);
        let source_root = env::var_os(SPYTRACE_SOURCE_ROOT).map(PathBuf::from);
        let fallback_path = Self::config_path().ok().filter(|path| path.is_file());
        Self::resolve(explicit.or(fallback_path), source_root)
    }

    fn resolve(path: Option<PathBuf>, source_root: Option<PathBuf>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if source_root.is_some() {
            config.source_root = source_root;
        }
        Ok(config)
    }

    /// Write the configuration as TOML, replacing `path` atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        write_atomic(path, &content)
            .with_context(|| format!("Failed to write config file: {path:?}"))?;

        debug!("Saved tracer configuration to {:?}", path);
        Ok(())
    }

    /// Replace the field mask
    pub fn with_fields(mut self, fields: FieldMask) -> Self {
        self.fields = fields;
        self
    }

    /// Replace the fallback
    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Enable or disable cooperation with the displaced hook
    pub fn with_cooperation(mut self, cooperate: bool) -> Self {
        self.cooperate = cooperate;
        self
    }

    /// Set the source root
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    /// Never record events sited in `file`
    pub fn with_ignored_file(mut self, file: impl Into<String>) -> Self {
        self.ignored_files.push(file.into());
        self
    }
}
