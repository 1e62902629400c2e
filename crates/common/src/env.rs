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

//! Environment variable name constants for Spytrace configuration.
//!
//! - [`SPYTRACE_CONFIG`] - Path of the tracer configuration file
//! - [`SPYTRACE_SOURCE_ROOT`] - Directory used to resolve relative source paths

/// Environment variable naming a TOML tracer configuration file.
///
/// # Default
///
/// When not set, `~/.spytrace.toml` is used if it exists, and the built-in defaults
/// otherwise.
///
/// # Examples
///
/// ```bash
/// SPYTRACE_CONFIG=./trace.toml cargo test
/// ```
pub const SPYTRACE_CONFIG: &str = "SPYTRACE_CONFIG";

/// Environment variable overriding the directory that relative source file names
/// (as produced by `file!()`) are resolved against when reconstructing a linetrace.
///
/// # Default
///
/// When not set, the current working directory and its ancestors are searched.
pub const SPYTRACE_SOURCE_ROOT: &str = "SPYTRACE_SOURCE_ROOT";
