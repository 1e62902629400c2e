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

//! Conversion of captured values into owned JSON.
//!
//! Every captured value is fully encoded at capture time, so later mutation of
//! the live value cannot alter a recorded event. Values that cannot be encoded
//! are handed to the configured [`Fallback`].

use std::{fmt, rc::Rc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spytrace_common::types::Variables;
use thiserror::Error;

use crate::{Bindings, Slot};

/// A value could not be encoded and the fallback refused to substitute it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot serialize `{name}` of type `{type_name}`: {reason}")]
pub struct SerializationError {
    /// Binding name of the value
    pub name: String,
    /// Type of the value
    pub type_name: &'static str,
    /// Why encoding failed
    pub reason: String,
}

/// A value that failed to encode, as seen by a [`Fallback`]
#[derive(Debug)]
pub struct Rejected<'a> {
    name: &'a str,
    slot: Slot<'a>,
    reason: String,
}

impl Rejected<'_> {
    /// Binding name of the value
    pub fn name(&self) -> &str {
        self.name
    }

    /// Type of the value
    pub fn type_name(&self) -> &'static str {
        self.slot.type_name()
    }

    /// Debug rendering of the value
    pub fn repr(&self) -> String {
        self.slot.repr()
    }

    /// Why encoding failed
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Substitute for values that cannot be encoded
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// The value's `Debug` rendering, as a string
    #[default]
    Repr,
    /// The marker `<unserializable TYPE>`
    TypeName,
    /// A fixed value
    Constant(Value),
    /// A caller-supplied conversion
    #[serde(skip)]
    Transform(Rc<dyn Fn(&Rejected<'_>) -> Value>),
    /// No substitute: the event is dropped and the failure is reported
    Error,
}

impl Fallback {
    /// A fixed substitute value
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    /// A caller-supplied conversion
    pub fn transform(f: impl Fn(&Rejected<'_>) -> Value + 'static) -> Self {
        Self::Transform(Rc::new(f))
    }

    /// Substitute for `rejected`, or `None` when the failure must be reported
    pub fn apply(&self, rejected: &Rejected<'_>) -> Option<Value> {
        match self {
            Self::Repr => Some(Value::String(rejected.repr())),
            Self::TypeName => {
                Some(Value::String(format!("<unserializable {}>", rejected.type_name())))
            }
            Self::Constant(value) => Some(value.clone()),
            Self::Transform(f) => Some(f(rejected)),
            Self::Error => None,
        }
    }
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repr => write!(f, "Repr"),
            Self::TypeName => write!(f, "TypeName"),
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Transform(_) => write!(f, "Transform(..)"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Encode one bound value
pub fn serialize(
    name: &str,
    slot: &Slot<'_>,
    fallback: &Fallback,
) -> Result<Value, SerializationError> {
    let reason = match slot {
        Slot::Value(value) => match value.encode() {
            Ok(encoded) => return Ok(encoded),
            Err(err) => err.to_string(),
        },
        Slot::Opaque { .. } => "type does not implement Serialize".to_string(),
    };

    let rejected = Rejected { name, slot: *slot, reason };
    fallback.apply(&rejected).ok_or_else(|| SerializationError {
        name: name.to_string(),
        type_name: slot.type_name(),
        reason: rejected.reason,
    })
}

/// Encode every binding; a later binding with the same name wins
pub fn serialize_bindings(
    bindings: &Bindings<'_>,
    fallback: &Fallback,
) -> Result<Variables, SerializationError> {
    bindings
        .iter()
        .map(|(name, slot)| -> Result<_, SerializationError> {
            Ok((name.to_string(), serialize(name, slot, fallback)?))
        })
        .collect()
}
