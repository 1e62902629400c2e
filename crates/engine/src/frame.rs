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

//! Emission points for instrumented code.
//!
//! Instrumented functions open a [`Frame`] on entry and report each statement,
//! return and error through it, passing the variables live at that point as
//! [`Bindings`]. Every report is handed to the hook installed on the current
//! thread, if any; without a hook a report costs one thread-local lookup.
//!
//! The `trace_*!` macros fill in the [`Site`] and build the bindings:
//!
//! ```ignore
//! fn square(x: i64) -> i64 {
//!     let frame = trace_call!("square"; x);
//!     trace_line!(frame; x); let y = x * x;
//!     trace_return!(frame, y; x, y);
//!     y
//! }
//! ```

use std::{
    cell::{Cell, RefCell},
    fmt,
    marker::PhantomData,
    panic::Location,
};

use serde::Serialize;
use serde_json::Value;
use spytrace_common::types::{EventKind, FrameId};

use crate::hook::{self, RawEvent};

thread_local! {
    static FRAME_STACK: RefCell<Vec<FrameId>> = const { RefCell::new(Vec::new()) };
    static NEXT_FRAME_ID: Cell<u64> = const { Cell::new(1) };
}

/// Source location of an emission point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Site {
    /// Source file, as reported by `file!()`
    pub file: &'static str,
    /// Line number (1-based)
    pub line: u32,
}

impl Site {
    /// Create a new site
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Site of the caller of the current `#[track_caller]` function
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for Site {
    fn from(location: &'static Location<'static>) -> Self {
        Self { file: location.file(), line: location.line() }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A value that can be captured into an event.
///
/// Implemented for every `Serialize + Debug` type. Values that are only `Debug` are
/// bound with [`Bindings::bind_opaque`] and always go through the fallback.
pub trait Capture {
    /// Encode the value into an owned JSON value
    fn encode(&self) -> serde_json::Result<Value>;

    /// Name of the value's type
    fn type_name(&self) -> &'static str;

    /// Debug rendering of the value
    fn repr(&self) -> String;
}

impl<T: Serialize + fmt::Debug> Capture for T {
    fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn repr(&self) -> String {
        format!("{self:?}")
    }
}

/// A borrowed, not yet serialized value
#[derive(Clone, Copy)]
pub enum Slot<'a> {
    /// A serde-encodable value
    Value(&'a dyn Capture),
    /// A value with no serde support
    Opaque {
        /// The value
        value: &'a dyn fmt::Debug,
        /// Name of the value's type
        type_name: &'static str,
    },
}

impl Slot<'_> {
    /// Name of the slot value's type
    pub fn type_name(&self) -> &'static str {
        match self {
            Slot::Value(value) => value.type_name(),
            Slot::Opaque { type_name, .. } => type_name,
        }
    }

    /// Debug rendering of the slot value
    pub fn repr(&self) -> String {
        match self {
            Slot::Value(value) => value.repr(),
            Slot::Opaque { value, .. } => format!("{value:?}"),
        }
    }
}

impl fmt::Debug for Slot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("type", &self.type_name()).field("value", &self.repr()).finish()
    }
}

/// Ordered list of variables live at an emission point
#[derive(Clone, Default)]
pub struct Bindings<'a> {
    slots: Vec<(&'static str, Slot<'a>)>,
}

impl<'a> Bindings<'a> {
    /// Create an empty binding list
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Bind a serde-encodable value
    pub fn bind<T: Serialize + fmt::Debug>(&mut self, name: &'static str, value: &'a T) -> &mut Self {
        self.slots.push((name, Slot::Value(value)));
        self
    }

    /// Bind a value without serde support; it is always captured through the fallback
    pub fn bind_opaque<T: fmt::Debug>(&mut self, name: &'static str, value: &'a T) -> &mut Self {
        self.slots
            .push((name, Slot::Opaque { value, type_name: std::any::type_name::<T>() }));
        self
    }

    /// Iterate over `(name, slot)` pairs in binding order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Slot<'a>)> {
        self.slots.iter().map(|(name, slot)| (*name, slot))
    }

    /// Names in binding order
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|(name, _)| *name).collect()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no bindings
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for Bindings<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.slots.iter().map(|(name, slot)| (name, slot))).finish()
    }
}

/// Provider of a frame's global bindings, evaluated only when globals are captured
pub type GlobalsFn = fn(&mut Bindings<'_>);

/// Static description of a frame, shared with hooks
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Identifier of this activation
    pub id: FrameId,
    /// Identifier of the calling activation
    pub parent: Option<FrameId>,
    /// Name of the instrumented function
    pub function: &'static str,
    /// Provider of global bindings
    pub globals: Option<GlobalsFn>,
}

/// Error description attached to exception events
#[derive(Debug, Serialize)]
struct ErrorInfo {
    #[serde(rename = "type")]
    type_name: &'static str,
    value: String,
}

/// One activation of an instrumented function.
///
/// Entering emits a `call` event. Dropping a frame that never reported a return
/// emits a `return` event without argument at its last site, the way an early
/// `?` return unwinds.
pub struct Frame {
    info: FrameInfo,
    last_site: Cell<Site>,
    returned: Cell<bool>,
    // frames belong to the thread-local frame stack
    _not_send: PhantomData<*const ()>,
}

impl Frame {
    /// Enter a function, reporting its arguments
    pub fn enter(function: &'static str, site: Site, args: &Bindings<'_>) -> Self {
        Self::enter_with_globals(function, None, site, args)
    }

    /// Enter a function whose globals are provided by `globals`
    pub fn enter_with_globals(
        function: &'static str,
        globals: Option<GlobalsFn>,
        site: Site,
        args: &Bindings<'_>,
    ) -> Self {
        let id = NEXT_FRAME_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            FrameId::new(id)
        });
        let parent = FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let parent = stack.last().copied();
            stack.push(id);
            parent
        });

        let frame = Self {
            info: FrameInfo { id, parent, function, globals },
            last_site: Cell::new(site),
            returned: Cell::new(false),
            _not_send: PhantomData,
        };
        frame.emit(EventKind::Call, site, None, args);
        frame
    }

    /// Report that the statement at `site` is about to execute
    pub fn line(&self, site: Site, locals: &Bindings<'_>) {
        self.emit(EventKind::Line, site, None, locals);
    }

    /// Report that the function returns `value`
    pub fn ret<T: Serialize + fmt::Debug>(&self, site: Site, value: &T, locals: &Bindings<'_>) {
        self.returned.set(true);
        self.emit(EventKind::Return, site, Some(Slot::Value(value)), locals);
    }

    /// Report that `error` was raised
    pub fn raise<E: fmt::Display + ?Sized>(&self, site: Site, error: &E, locals: &Bindings<'_>) {
        let info = ErrorInfo { type_name: std::any::type_name::<E>(), value: error.to_string() };
        self.emit(EventKind::Exception, site, Some(Slot::Value(&info)), locals);
    }

    /// Identifier of this activation
    pub fn id(&self) -> FrameId {
        self.info.id
    }

    /// Identifier of the calling activation
    pub fn parent(&self) -> Option<FrameId> {
        self.info.parent
    }

    /// Name of the instrumented function
    pub fn function(&self) -> &'static str {
        self.info.function
    }

    fn emit(&self, kind: EventKind, site: Site, arg: Option<Slot<'_>>, locals: &Bindings<'_>) {
        self.last_site.set(site);
        hook::dispatch(&RawEvent { kind, site, frame: &self.info, arg, locals });
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("info", &self.info)
            .field("last_site", &self.last_site.get())
            .field("returned", &self.returned.get())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if !self.returned.get() {
            self.emit(EventKind::Return, self.last_site.get(), None, &Bindings::new());
        }
        let id = self.info.id;
        let _ = FRAME_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(position) = stack.iter().rposition(|frame| *frame == id) {
                stack.remove(position);
            }
        });
    }
}
