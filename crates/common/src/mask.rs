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

//! Field selection for captured events.
//!
//! A [`FieldMask`] is a presence tree over event attribute names. A branch that is
//! present (even with no children) is captured; a branch that is absent is never
//! captured. Views that need an attribute call [`FieldMask::require`] and fail with
//! [`RequiredFieldMissing`] instead of returning partial data.
//!
//! In configuration files a mask is written either as a nested table whose leaves
//! are `true` (present) or `false` (absent), or as a flat list of dotted paths:
//!
//! ```toml
//! [fields]
//! event = true
//! frame = { lineno = true, locals = true, code = { filename = true } }
//!
//! # equivalent
//! # fields = ["event", "frame.lineno", "frame.locals", "frame.code.filename"]
//! ```

use std::{collections::BTreeMap, fmt};

use itertools::Itertools;
use serde::{
    de::{self, MapAccess, SeqAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use thiserror::Error;

/// Dotted paths of every attribute the engine knows how to capture.
pub mod fields {
    /// Kind of the event (`call`, `line`, `return`, `exception`)
    pub const EVENT: &str = "event";
    /// Event argument (return value, raised error)
    pub const ARG: &str = "arg";
    /// Frame branch
    pub const FRAME: &str = "frame";
    /// Identifier of the emitting frame
    pub const FRAME_ID: &str = "frame.id";
    /// Identifier of the calling frame
    pub const FRAME_BACK: &str = "frame.back";
    /// Line number of the emission point
    pub const LINENO: &str = "frame.lineno";
    /// Local bindings
    pub const LOCALS: &str = "frame.locals";
    /// Global bindings
    pub const GLOBALS: &str = "frame.globals";
    /// Code branch
    pub const CODE: &str = "frame.code";
    /// Source file of the emission point
    pub const FILENAME: &str = "frame.code.filename";
    /// Name of the instrumented function
    pub const FUNCTION: &str = "frame.code.name";

    /// All known paths, branches included.
    pub const KNOWN: [&str; 11] =
        [EVENT, ARG, FRAME, FRAME_ID, FRAME_BACK, LINENO, LOCALS, GLOBALS, CODE, FILENAME, FUNCTION];
}

/// A view needed an attribute that was not captured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("required field `{path}` was not captured (active field mask: {mask})")]
pub struct RequiredFieldMissing {
    /// Dotted path of the missing attribute
    pub path: String,
    /// Rendering of the mask that was active
    pub mask: String,
}

/// A mask named an attribute the engine does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown field `{0}` in field mask")]
pub struct UnknownField(pub String);

/// Presence tree selecting which event attributes are captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMask {
    children: BTreeMap<String, FieldMask>,
}

impl Default for FieldMask {
    /// Event kind, argument, file name, line number and locals: enough for a linetrace.
    fn default() -> Self {
        Self::from_paths([
            fields::EVENT,
            fields::ARG,
            fields::FILENAME,
            fields::LINENO,
            fields::LOCALS,
        ])
    }
}

impl FieldMask {
    /// A mask that captures nothing
    pub fn empty() -> Self {
        Self { children: BTreeMap::new() }
    }

    /// A mask selecting every known attribute, globals included
    pub fn all() -> Self {
        Self::from_paths(fields::KNOWN)
    }

    /// Build a mask from dotted paths. Intermediate branches are implied.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mask = Self::empty();
        for path in paths {
            mask.insert(path.as_ref());
        }
        mask
    }

    /// Select `path` and every branch leading to it
    pub fn insert(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_insert_with(Self::empty);
        }
    }

    /// Builder-style [`FieldMask::insert`]
    pub fn with(mut self, path: &str) -> Self {
        self.insert(path);
        self
    }

    /// Deselect `path` and everything below it
    pub fn remove(&mut self, path: &str) {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut node = self;
        for segment in parents {
            match node.children.get_mut(*segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.children.remove(*last);
    }

    /// Builder-style [`FieldMask::remove`]
    pub fn without(mut self, path: &str) -> Self {
        self.remove(path);
        self
    }

    /// Sub-mask of a direct child, if present
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.get(name)
    }

    /// Whether the dotted `path` was selected
    pub fn contains(&self, path: &str) -> bool {
        let mut node = self;
        for segment in path.split('.') {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    /// Like [`FieldMask::contains`], but fails when the path is absent
    pub fn require(&self, path: &str) -> Result<(), RequiredFieldMissing> {
        if self.contains(path) {
            Ok(())
        } else {
            Err(RequiredFieldMissing { path: path.to_string(), mask: self.to_string() })
        }
    }

    /// Whether nothing is selected
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Dotted paths of all selected leaves, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out, false);
        out
    }

    /// Check every selected path, branches included, against the known attributes
    pub fn validate(&self) -> Result<(), UnknownField> {
        let mut all = Vec::new();
        self.collect_paths("", &mut all, true);
        match all.into_iter().find(|path| !fields::KNOWN.contains(&path.as_str())) {
            Some(path) => Err(UnknownField(path)),
            None => Ok(()),
        }
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>, branches: bool) {
        for (name, child) in &self.children {
            let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };
            if branches || child.is_empty() {
                out.push(path.clone());
            }
            child.collect_paths(&path, out, branches);
        }
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.children.iter().map(|(name, child)| {
            if child.is_empty() {
                name.clone()
            } else {
                format!("{name}: {child}")
            }
        });
        write!(f, "{{{}}}", entries.format(", "))
    }
}

impl Serialize for FieldMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.children.len()))?;
        for (name, child) in &self.children {
            if child.is_empty() {
                map.serialize_entry(name, &true)?;
            } else {
                map.serialize_entry(name, child)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MaskVisitor)
    }
}

struct MaskVisitor;

impl<'de> Visitor<'de> for MaskVisitor {
    type Value = FieldMask;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a table of field names mapped to booleans or tables, or a list of paths")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FieldMask, A::Error> {
        let mut mask = FieldMask::empty();
        while let Some(name) = map.next_key::<String>()? {
            if let MaskNode::Present(child) = map.next_value::<MaskNode>()? {
                mask.children.insert(name, child);
            }
        }
        Ok(mask)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<FieldMask, A::Error> {
        let mut mask = FieldMask::empty();
        while let Some(path) = seq.next_element::<String>()? {
            mask.insert(&path);
        }
        Ok(mask)
    }
}

/// One entry of a mask table: `true`, `false` or a nested table
enum MaskNode {
    Present(FieldMask),
    Absent,
}

impl<'de> Deserialize<'de> for MaskNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = MaskNode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("`true`, `false` or a nested table")
            }

            fn visit_bool<E: de::Error>(self, present: bool) -> Result<MaskNode, E> {
                Ok(if present { MaskNode::Present(FieldMask::empty()) } else { MaskNode::Absent })
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<MaskNode, A::Error> {
                MaskVisitor.visit_map(map).map(MaskNode::Present)
            }
        }

        deserializer.deserialize_any(NodeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_mask_supports_linetrace() {
        let mask = FieldMask::default();
        assert!(mask.contains(fields::EVENT));
        assert!(mask.contains(fields::ARG));
        assert!(mask.contains(fields::FILENAME));
        assert!(mask.contains(fields::LINENO));
        assert!(mask.contains(fields::LOCALS));
        assert!(!mask.contains(fields::GLOBALS));
        assert!(!mask.contains(fields::FRAME_ID));
        // branches leading to a leaf are present too
        assert!(mask.contains(fields::FRAME));
        assert!(mask.contains(fields::CODE));
    }

    #[test]
    fn test_empty_branch_is_present_without_children() {
        let mask = FieldMask::from_paths(["frame"]);
        assert!(mask.contains("frame"));
        assert!(!mask.contains("frame.locals"));
        assert_eq!(mask.child("frame"), Some(&FieldMask::empty()));
    }

    #[test]
    fn test_require_reports_path_and_mask() {
        let mask = FieldMask::from_paths(["event", "frame.lineno"]);
        let err = mask.require(fields::FILENAME).unwrap_err();
        assert_eq!(err.path, "frame.code.filename");
        assert_eq!(err.mask, "{event, frame: {lineno}}");
        let message = err.to_string();
        assert!(message.contains("frame.code.filename"));
        assert!(message.contains("{event, frame: {lineno}}"));
    }

    #[test]
    fn test_remove_drops_subtree() {
        let mask = FieldMask::all().without("frame.code");
        assert!(!mask.contains(fields::FILENAME));
        assert!(!mask.contains(fields::FUNCTION));
        assert!(mask.contains(fields::LOCALS));
    }

    #[test]
    fn test_paths_lists_leaves_only() {
        let mask = FieldMask::default();
        assert_eq!(
            mask.paths(),
            vec!["arg", "event", "frame.code.filename", "frame.lineno", "frame.locals"]
        );
    }

    #[test]
    fn test_validate_rejects_unknown_paths() {
        assert!(FieldMask::all().validate().is_ok());
        let err = FieldMask::default().with("frame.lokals").validate().unwrap_err();
        assert_eq!(err, UnknownField("frame.lokals".into()));
    }

    #[test]
    fn test_deserialize_nested_table() {
        let mask: FieldMask = serde_json::from_value(json!({
            "event": true,
            "arg": false,
            "frame": { "code": { "filename": true }, "lineno": true, "globals": {} }
        }))
        .unwrap();

        assert!(mask.contains("event"));
        assert!(!mask.contains("arg"));
        assert!(mask.contains("frame.code.filename"));
        assert!(mask.contains("frame.globals"));
        assert!(!mask.contains("frame.locals"));
    }

    #[test]
    fn test_deserialize_path_list() {
        let mask: FieldMask = serde_json::from_value(json!(["event", "frame.locals"])).unwrap();
        assert_eq!(mask, FieldMask::from_paths(["event", "frame.locals"]));
    }

    #[test]
    fn test_deserialize_rejects_string_placeholders() {
        let result = serde_json::from_value::<FieldMask>(json!({ "event": "" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mask = FieldMask::default().with(fields::GLOBALS);
        let text = toml::to_string(&mask).unwrap();
        let decoded: FieldMask = toml::from_str(&text).unwrap();
        assert_eq!(decoded, mask);
    }
}
