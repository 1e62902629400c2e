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

//! JSON and CSV rendering of snapshots and events, and atomic file output.

use std::{
    io::{self, Write},
    path::Path,
};

use serde::Serialize;
use spytrace_common::types::{Snapshot, TraceEvent};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::TraceError;

/// A row type with a fixed CSV layout
pub trait Record: Serialize {
    /// Column names, in order
    const FIELDS: &'static [&'static str];

    /// Cell texts, in column order. Nested values are JSON text; absent values are empty.
    fn cells(&self) -> Result<Vec<String>, serde_json::Error>;
}

fn cell<T: Serialize>(value: &Option<T>) -> Result<String, serde_json::Error> {
    match value {
        Some(value) => serde_json::to_string(value),
        None => Ok(String::new()),
    }
}

fn plain<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl Record for Snapshot {
    const FIELDS: &'static [&'static str] = &Snapshot::FIELDS;

    fn cells(&self) -> Result<Vec<String>, serde_json::Error> {
        Ok(vec![
            self.filename.clone(),
            self.line_number.to_string(),
            self.line_content.clone(),
            cell(&self.locals)?,
            cell(&self.globals)?,
        ])
    }
}

impl Record for TraceEvent {
    const FIELDS: &'static [&'static str] = &TraceEvent::FIELDS;

    fn cells(&self) -> Result<Vec<String>, serde_json::Error> {
        Ok(vec![
            plain(&self.event),
            plain(&self.filename),
            plain(&self.line_number),
            plain(&self.function),
            plain(&self.frame_id),
            plain(&self.parent_frame_id),
            cell(&self.arg)?,
            cell(&self.locals)?,
            cell(&self.globals)?,
        ])
    }
}

/// Pretty-printed JSON array of `records`
pub fn to_json<R: Serialize>(records: &[R]) -> Result<String, TraceError> {
    Ok(serde_json::to_string_pretty(records)?)
}

/// CSV text of `records`: a header row, then one row per record
pub fn to_csv<R: Record>(records: &[R]) -> Result<String, TraceError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(R::FIELDS)?;
    for record in records {
        writer.write_record(record.cells()?)?;
    }

    let bytes = writer.into_inner().map_err(|err| csv::Error::from(err.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Write `contents` to `path` through a temporary file in the same directory.
///
/// Readers of `path` see either the old file or the complete new one.
pub fn write_atomic(path: impl AsRef<Path>, contents: &str) -> Result<(), TraceError> {
    let path = path.as_ref();
    let write_error = |source: io::Error| TraceError::Write { path: path.to_path_buf(), source };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir).map_err(write_error)?;
    file.write_all(contents.as_bytes()).map_err(write_error)?;
    file.as_file().sync_all().map_err(write_error)?;
    file.persist(path).map_err(|err| write_error(err.error))?;

    debug!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}
