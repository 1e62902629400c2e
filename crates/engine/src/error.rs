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

use std::{io, path::PathBuf};

use spytrace_common::{RequiredFieldMissing, UnknownField};
use thiserror::Error;

use crate::SerializationError;

/// Errors surfaced by the tracer and its views
#[derive(Debug, Error)]
pub enum TraceError {
    /// A view needs an attribute the field mask did not select
    #[error(transparent)]
    MissingField(#[from] RequiredFieldMissing),

    /// The field mask names an attribute that does not exist
    #[error(transparent)]
    UnknownField(#[from] UnknownField),

    /// A captured value could not be serialized and the fallback refused it
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A source file needed for the linetrace could not be read
    #[error("failed to read source file {}: {source}", path.display())]
    SourceRead {
        /// Resolved path of the file
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A line event points past the end of its source file
    #[error("line {line} is out of range for {} ({len} lines)", path.display())]
    LineOutOfRange {
        /// Resolved path of the file
        path: PathBuf,
        /// Requested line (1-based)
        line: u32,
        /// Number of lines in the file
        len: usize,
    },

    /// A trace was started while another one is running on the same tracer
    #[error("tracer is already tracing")]
    AlreadyTracing,

    /// JSON encoding failed
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV encoding failed
    #[error("failed to encode CSV: {0}")]
    Csv(#[from] csv::Error),

    /// An output file could not be written
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Target path
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },
}
