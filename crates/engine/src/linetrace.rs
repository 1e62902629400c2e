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

//! Linetrace reconstruction.
//!
//! A linetrace is the subsequence of line events paired with the text of the
//! source line each one points at.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use spytrace_common::{
    fields,
    types::{Snapshot, TraceEvent},
    FieldMask, RequiredFieldMissing,
};
use tracing::{debug, trace};

use crate::TraceError;

/// Maps recorded file names to paths on disk.
///
/// `file!()` yields paths relative to the workspace root, while tests and binaries
/// usually run from a package directory. Relative names are therefore tried against
/// the root and each of its ancestors in turn.
#[derive(Debug, Clone, Default)]
pub struct SourceResolver {
    root: Option<PathBuf>,
}

impl SourceResolver {
    /// Resolve against `root`, or the working directory when `None`
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// The configured root
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Path on disk for a recorded file name
    pub fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        let root = match &self.root {
            Some(root) => root.clone(),
            None => env::current_dir().unwrap_or_default(),
        };
        root.ancestors()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| root.join(path))
    }
}

#[derive(Debug)]
struct SourceFile {
    path: PathBuf,
    lines: Vec<String>,
}

/// Source lines read on demand, each file at most once
#[derive(Debug)]
pub struct SourceCache<'r> {
    resolver: &'r SourceResolver,
    files: HashMap<String, SourceFile>,
}

impl<'r> SourceCache<'r> {
    /// Create an empty cache
    pub fn new(resolver: &'r SourceResolver) -> Self {
        Self { resolver, files: HashMap::new() }
    }

    /// Text of line `line_number` (1-based) of `filename`, trailing whitespace removed
    pub fn line(&mut self, filename: &str, line_number: u32) -> Result<String, TraceError> {
        if !self.files.contains_key(filename) {
            let file = self.load(filename)?;
            self.files.insert(filename.to_string(), file);
        }
        let file = &self.files[filename];

        let index = (line_number as usize).checked_sub(1);
        index.and_then(|index| file.lines.get(index)).cloned().ok_or_else(|| {
            TraceError::LineOutOfRange {
                path: file.path.clone(),
                line: line_number,
                len: file.lines.len(),
            }
        })
    }

    /// Number of distinct files read so far
    pub fn files_read(&self) -> usize {
        self.files.len()
    }

    fn load(&self, filename: &str) -> Result<SourceFile, TraceError> {
        let path = self.resolver.resolve(filename);
        let text = fs::read_to_string(&path)
            .map_err(|source| TraceError::SourceRead { path: path.clone(), source })?;
        trace!("Read source file {}", path.display());

        let lines = text.lines().map(|line| line.trim_end().to_string()).collect();
        Ok(SourceFile { path, lines })
    }
}

/// Pair every line event with the source line it points at.
///
/// Requires the mask to select the event kind, the file name and the line number.
/// Locals and globals are copied when present.
pub fn linetrace<'a, I>(
    events: I,
    mask: &FieldMask,
    resolver: &SourceResolver,
) -> Result<Vec<Snapshot>, TraceError>
where
    I: IntoIterator<Item = &'a TraceEvent>,
{
    mask.require(fields::EVENT)?;
    mask.require(fields::FILENAME)?;
    mask.require(fields::LINENO)?;

    let mut sources = SourceCache::new(resolver);
    let mut snapshots = Vec::new();
    for event in events.into_iter().filter(|event| event.is_line()) {
        let (Some(filename), Some(line_number)) = (&event.filename, event.line_number) else {
            return Err(RequiredFieldMissing {
                path: fields::FILENAME.to_string(),
                mask: mask.to_string(),
            }
            .into());
        };

        snapshots.push(Snapshot {
            filename: filename.clone(),
            line_number,
            line_content: sources.line(filename, line_number)?,
            locals: event.locals.clone(),
            globals: event.globals.clone(),
        });
    }

    debug!("Reconstructed {} snapshots from {} source files", snapshots.len(), sources.files_read());
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use spytrace_common::types::EventKind;
    use tempfile::NamedTempFile;

    use super::*;

    fn source_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "let a = 1;   \n    let b = a;\r\n\nlet c = b;\n").unwrap();
        file
    }

    fn line_event(filename: &str, line: u32) -> TraceEvent {
        TraceEvent {
            event: Some(EventKind::Line),
            filename: Some(filename.to_string()),
            line_number: Some(line),
            ..Default::default()
        }
    }

    #[test]
    fn test_lines_are_right_trimmed_and_cached() {
        let file = source_file();
        let name = file.path().to_string_lossy().into_owned();
        let resolver = SourceResolver::default();
        let mut cache = SourceCache::new(&resolver);

        assert_eq!(cache.line(&name, 1).unwrap(), "let a = 1;");
        assert_eq!(cache.line(&name, 2).unwrap(), "    let b = a;");
        assert_eq!(cache.line(&name, 3).unwrap(), "");
        assert_eq!(cache.line(&name, 4).unwrap(), "let c = b;");
        assert_eq!(cache.files_read(), 1);
    }

    #[test]
    fn test_out_of_range_lines() {
        let file = source_file();
        let name = file.path().to_string_lossy().into_owned();
        let resolver = SourceResolver::default();
        let mut cache = SourceCache::new(&resolver);

        assert!(matches!(cache.line(&name, 0), Err(TraceError::LineOutOfRange { line: 0, .. })));
        assert!(matches!(
            cache.line(&name, 5),
            Err(TraceError::LineOutOfRange { line: 5, len: 4, .. })
        ));
    }

    #[test]
    fn test_relative_names_resolve_against_ancestors() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("src")).unwrap();
        fs::write(root.path().join("src/lib.rs"), "fn main() {}\n").unwrap();
        let nested = root.path().join("crates/inner");
        fs::create_dir_all(&nested).unwrap();

        let resolver = SourceResolver::new(Some(nested));
        assert_eq!(resolver.resolve("src/lib.rs"), root.path().join("src/lib.rs"));
        assert_eq!(resolver.root().map(|root| root.ends_with("inner")), Some(true));
    }

    #[test]
    fn test_linetrace_keeps_only_line_events() {
        let file = source_file();
        let name = file.path().to_string_lossy().into_owned();

        let call = TraceEvent { event: Some(EventKind::Call), ..line_event(&name, 1) };
        let events = vec![call, line_event(&name, 1), line_event(&name, 4)];
        let snapshots =
            linetrace(&events, &FieldMask::default(), &SourceResolver::default()).unwrap();

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].line_number, 1);
        assert_eq!(snapshots[1].line_content, "let c = b;");
        assert_eq!(snapshots[1].locals, None);
    }

    #[test]
    fn test_linetrace_requires_position_fields() {
        let mask = FieldMask::default().without(fields::LINENO);
        let err = linetrace(&Vec::new(), &mask, &SourceResolver::default()).unwrap_err();
        assert!(matches!(err, TraceError::MissingField(ref missing) if missing.path == fields::LINENO));
    }

    #[test]
    fn test_missing_source_file() {
        let events = vec![line_event("/nonexistent/spytrace/source.rs", 1)];
        let err =
            linetrace(&events, &FieldMask::default(), &SourceResolver::default()).unwrap_err();
        assert!(matches!(err, TraceError::SourceRead { .. }));
    }
}
