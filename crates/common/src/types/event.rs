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

use std::ops::{Deref, DerefMut};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized variable bindings, keyed by variable name.
pub type Variables = serde_json::Map<String, Value>;

/// Kind of an execution event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A function was entered
    #[display("call")]
    Call,
    /// A statement is about to execute
    #[display("line")]
    Line,
    /// A function is returning
    #[display("return")]
    Return,
    /// An error was raised inside a function
    #[display("exception")]
    Exception,
}

/// Opaque identifier of one activation of an instrumented function
///
/// Identifiers are unique per thread for the lifetime of the process. They only
/// correlate events with each other and carry no ownership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct FrameId(pub u64);

impl FrameId {
    /// Create a new frame ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value of this ID
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A recorded execution event.
///
/// Every attribute is optional: it is `None` when the field mask active at trace time
/// did not select it (or, for `arg`, when the event carries no argument).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Kind of the event
    pub event: Option<EventKind>,
    /// Source file of the emission point
    pub filename: Option<String>,
    /// Line of the emission point (1-based)
    pub line_number: Option<u32>,
    /// Name of the instrumented function
    pub function: Option<String>,
    /// Frame that emitted the event
    pub frame_id: Option<FrameId>,
    /// Frame that called the emitting frame
    pub parent_frame_id: Option<FrameId>,
    /// Event argument: the return value, or the error on exceptions
    pub arg: Option<Value>,
    /// Local bindings live at the emission point
    pub locals: Option<Variables>,
    /// Global bindings of the emitting frame
    pub globals: Option<Variables>,
}

impl TraceEvent {
    /// Field names in declaration order, used as the CSV header.
    pub const FIELDS: [&'static str; 9] = [
        "event",
        "filename",
        "line_number",
        "function",
        "frame_id",
        "parent_frame_id",
        "arg",
        "locals",
        "globals",
    ];

    /// Whether this is a line event
    pub fn is_line(&self) -> bool {
        self.event == Some(EventKind::Line)
    }
}

/// Ordered log of recorded events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog {
    inner: Vec<TraceEvent>,
}

impl Deref for EventLog {
    type Target = Vec<TraceEvent>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for EventLog {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl EventLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct file names referenced by the log, in sorted order
    pub fn filenames(&self) -> std::collections::BTreeSet<String> {
        self.inner.iter().filter_map(|event| event.filename.clone()).collect()
    }
}

impl From<Vec<TraceEvent>> for EventLog {
    fn from(inner: Vec<TraceEvent>) -> Self {
        Self { inner }
    }
}

impl IntoIterator for EventLog {
    type Item = TraceEvent;
    type IntoIter = std::vec::IntoIter<TraceEvent>;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a TraceEvent;
    type IntoIter = std::slice::Iter<'a, TraceEvent>;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_value(EventKind::Line).unwrap(), json!("line"));
        assert_eq!(EventKind::Exception.to_string(), "exception");

        let kind: EventKind = serde_json::from_value(json!("return")).unwrap();
        assert_eq!(kind, EventKind::Return);
    }

    #[test]
    fn test_trace_event_json_keys_follow_declared_order() {
        let event = TraceEvent {
            event: Some(EventKind::Call),
            line_number: Some(7),
            frame_id: Some(FrameId::new(3)),
            ..Default::default()
        };

        let text = serde_json::to_string(&event).unwrap();
        let keys: Vec<usize> =
            TraceEvent::FIELDS.iter().map(|field| text.find(&format!("\"{field}\"")).unwrap()).collect();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(text.contains("\"frame_id\":3"));
        assert!(text.contains("\"filename\":null"));
    }

    #[test]
    fn test_event_log_filenames_are_distinct() {
        let log: EventLog = vec![
            TraceEvent { filename: Some("b.rs".into()), ..Default::default() },
            TraceEvent { filename: Some("a.rs".into()), ..Default::default() },
            TraceEvent { filename: Some("b.rs".into()), ..Default::default() },
            TraceEvent::default(),
        ]
        .into();

        let names: Vec<_> = log.filenames().into_iter().collect();
        assert_eq!(names, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }
}
