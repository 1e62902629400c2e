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

//! Spytrace Common - Shared types for Spytrace components
//!
//! This crate provides the data model shared by the tracing engine and its
//! consumers: recorded events, linetrace snapshots, field masks, and logging setup.

/// Recorded execution events and linetrace snapshots
pub mod types;

/// Environment variable names understood by Spytrace
pub mod env;
/// Logging setup and utilities for consistent logging across Spytrace components
pub mod logging;
/// Field masks selecting which event attributes are captured
pub mod mask;

pub use logging::*;
pub use mask::*;
