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

//! Event capture engine.
//!
//! [`TraceEngine`] installs a recorder as the thread's trace hook, turns every raw
//! event into a [`TraceEvent`] holding only the attributes selected by its
//! [`FieldMask`], and puts the displaced hook back when stopped.
//!
//! Events sited in the engine's own source files are never recorded, and on stop
//! the events produced by the teardown call itself are cut off the end of the log.

use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::Rc,
};

use spytrace_common::{
    fields,
    types::{EventKind, EventLog, FrameId, TraceEvent},
    FieldMask,
};
use tracing::{debug, trace, warn};

use crate::{
    hook::{self, same_hook, RawEvent, TraceHook},
    serialize, serialize_bindings, tracer, Bindings, Fallback, SerializationError, Site,
};

/// Source files whose events are never recorded
pub fn engine_source_files() -> [&'static str; 3] {
    [file!(), hook::SOURCE_FILE, tracer::SOURCE_FILE]
}

/// Attributes selected by a mask, resolved once per engine
#[derive(Debug, Clone, Copy)]
struct Selection {
    event: bool,
    arg: bool,
    filename: bool,
    lineno: bool,
    function: bool,
    frame_id: bool,
    frame_back: bool,
    locals: bool,
    globals: bool,
}

impl From<&FieldMask> for Selection {
    fn from(mask: &FieldMask) -> Self {
        Self {
            event: mask.contains(fields::EVENT),
            arg: mask.contains(fields::ARG),
            filename: mask.contains(fields::FILENAME),
            lineno: mask.contains(fields::LINENO),
            function: mask.contains(fields::FUNCTION),
            frame_id: mask.contains(fields::FRAME_ID),
            frame_back: mask.contains(fields::FRAME_BACK),
            locals: mask.contains(fields::LOCALS),
            globals: mask.contains(fields::GLOBALS),
        }
    }
}

/// A recorded event together with the unmasked data the engine keeps for itself
#[derive(Debug, Clone)]
pub(crate) struct RecordedEvent {
    pub event: TraceEvent,
    pub kind: EventKind,
    pub site: Site,
    pub frame: FrameId,
    pub function: &'static str,
}

/// The hook installed while an engine is active
struct Recorder {
    active: Cell<bool>,
    selection: Selection,
    fallback: Fallback,
    ignored: RefCell<HashSet<String>>,
    cooperate: Cell<bool>,
    previous: RefCell<Option<Rc<dyn TraceHook>>>,
    log: RefCell<Vec<RecordedEvent>>,
    capture_error: RefCell<Option<SerializationError>>,
}

impl Recorder {
    fn capture(&self, raw: &RawEvent<'_>) -> Result<TraceEvent, SerializationError> {
        let selected = self.selection;

        let arg = match raw.arg {
            Some(slot) if selected.arg => Some(serialize("<arg>", &slot, &self.fallback)?),
            _ => None,
        };
        let locals = if selected.locals {
            Some(serialize_bindings(raw.locals, &self.fallback)?)
        } else {
            None
        };
        let globals = if selected.globals {
            let mut bindings = Bindings::new();
            if let Some(provide) = raw.frame.globals {
                provide(&mut bindings);
            }
            Some(serialize_bindings(&bindings, &self.fallback)?)
        } else {
            None
        };

        Ok(TraceEvent {
            event: selected.event.then_some(raw.kind),
            filename: selected.filename.then(|| raw.site.file.to_string()),
            line_number: selected.lineno.then_some(raw.site.line),
            function: selected.function.then(|| raw.frame.function.to_string()),
            frame_id: selected.frame_id.then_some(raw.frame.id),
            parent_frame_id: if selected.frame_back { raw.frame.parent } else { None },
            arg,
            locals,
            globals,
        })
    }

    fn record(&self, raw: &RawEvent<'_>) {
        if self.ignored.borrow().contains(raw.site.file) {
            trace!("Dropping {} event from engine source {}", raw.kind, raw.site);
            return;
        }

        match self.capture(raw) {
            Ok(event) => self.log.borrow_mut().push(RecordedEvent {
                event,
                kind: raw.kind,
                site: raw.site,
                frame: raw.frame.id,
                function: raw.frame.function,
            }),
            Err(err) => {
                warn!("Failed to capture {} event at {}: {}", raw.kind, raw.site, err);
                let mut slot = self.capture_error.borrow_mut();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }
    }

    /// Hand the event to the hook that was displaced, with that hook installed
    fn forward(&self, raw: &RawEvent<'_>) {
        let Some(previous) = self.previous.borrow().clone() else {
            return;
        };
        let ours = hook::replace(Some(previous.clone()));
        previous.on_event(raw);
        hook::replace(ours);
    }
}

impl TraceHook for Recorder {
    fn on_event(&self, event: &RawEvent<'_>) {
        if !self.active.get() {
            // still linked by a hook that could not unlink it
            self.forward(event);
            return;
        }
        self.record(event);
        if self.cooperate.get() {
            self.forward(event);
        }
    }

    fn unlink(&self, hook: &Rc<dyn TraceHook>, replacement: Option<Rc<dyn TraceHook>>) -> bool {
        let displaced = self.previous.borrow().clone();
        match displaced {
            Some(displaced) if same_hook(&displaced, hook) => {
                *self.previous.borrow_mut() = replacement;
                true
            }
            Some(displaced) => displaced.unlink(hook, replacement),
            None => false,
        }
    }
}

/// Records events emitted on the current thread while active
pub struct TraceEngine {
    mask: FieldMask,
    recorder: Rc<Recorder>,
}

impl TraceEngine {
    /// Create an idle engine capturing the attributes selected by `mask`
    pub fn new(mask: FieldMask, fallback: Fallback) -> Self {
        let ignored = engine_source_files().into_iter().map(str::to_string).collect();
        let recorder = Recorder {
            active: Cell::new(false),
            selection: Selection::from(&mask),
            fallback,
            ignored: RefCell::new(ignored),
            cooperate: Cell::new(false),
            previous: RefCell::new(None),
            log: RefCell::new(Vec::new()),
            capture_error: RefCell::new(None),
        };
        Self { mask, recorder: Rc::new(recorder) }
    }

    /// Forward every event to the displaced hook as well
    pub fn with_cooperation(self, cooperate: bool) -> Self {
        self.recorder.cooperate.set(cooperate);
        self
    }

    /// Enable or disable forwarding to the displaced hook
    pub fn set_cooperation(&mut self, cooperate: bool) {
        self.recorder.cooperate.set(cooperate);
    }

    /// Never record events sited in `file`
    pub fn ignore_file(&mut self, file: impl Into<String>) {
        self.recorder.ignored.borrow_mut().insert(file.into());
    }

    /// Files whose events are never recorded, sorted
    pub fn ignored_files(&self) -> Vec<String> {
        let mut files: Vec<_> = self.recorder.ignored.borrow().iter().cloned().collect();
        files.sort();
        files
    }

    /// The active field mask
    pub fn mask(&self) -> &FieldMask {
        &self.mask
    }

    /// Whether cooperation with the displaced hook is enabled
    pub fn cooperates(&self) -> bool {
        self.recorder.cooperate.get()
    }

    /// Whether the recorder is installed
    pub fn is_active(&self) -> bool {
        self.recorder.active.get()
    }

    /// Install the recorder on the current thread
    pub fn start(&mut self) {
        if self.is_active() {
            warn!("Trace engine already started");
            return;
        }

        let recorder: Rc<dyn TraceHook> = self.recorder.clone();
        let previous = hook::replace(Some(recorder));
        debug!(cooperate = self.cooperates(), displaced = previous.is_some(), "Trace engine started");
        *self.recorder.previous.borrow_mut() = previous;
        self.recorder.active.set(true);
    }

    /// Restore the displaced hook and cut off the events of this call
    #[track_caller]
    pub fn stop(&mut self) {
        self.stop_at(Site::caller());
    }

    /// Restore the displaced hook and cut off the events emitted from `teardown`.
    ///
    /// The log is truncated at the last event sited at `teardown`, if any.
    pub fn stop_at(&mut self, teardown: Site) {
        if !self.restore() {
            return;
        }

        let mut log = self.recorder.log.borrow_mut();
        if let Some(position) = log.iter().rposition(|record| record.site == teardown) {
            debug!("Cutting {} teardown events at {}", log.len() - position, teardown);
            log.truncate(position);
        }
        debug!("Trace engine stopped with {} events", log.len());
    }

    /// Put the displaced hook back; false when the engine was not active.
    ///
    /// When another hook was installed on top of ours, ours is unlinked from the
    /// chain instead and the slot is left alone.
    fn restore(&mut self) -> bool {
        if !self.recorder.active.replace(false) {
            return false;
        }

        let ours: Rc<dyn TraceHook> = self.recorder.clone();
        let previous = self.recorder.previous.borrow_mut().take();
        match hook::current() {
            Some(installed) if same_hook(&installed, &ours) => {
                hook::replace(previous);
            }
            Some(installed) => {
                if installed.unlink(&ours, previous.clone()) {
                    debug!("Trace engine stopped out of order, unlinked from the hook chain");
                } else {
                    warn!("Trace hook was replaced while the engine was active");
                    *self.recorder.previous.borrow_mut() = previous;
                }
            }
            None => warn!("Trace hook slot was cleared while the engine was active"),
        }
        true
    }

    /// Recorded events, in emission order
    pub fn events(&self) -> EventLog {
        self.recorder.log.borrow().iter().map(|record| record.event.clone()).collect::<Vec<_>>().into()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.recorder.log.borrow().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.recorder.log.borrow().is_empty()
    }

    /// Forget every recorded event and capture failure
    pub fn clear(&mut self) {
        self.recorder.log.borrow_mut().clear();
        self.recorder.capture_error.borrow_mut().take();
    }

    /// The first capture failure since the last call
    pub fn take_capture_error(&mut self) -> Option<SerializationError> {
        self.recorder.capture_error.borrow_mut().take()
    }

    pub(crate) fn with_records<R>(&self, f: impl FnOnce(&[RecordedEvent]) -> R) -> R {
        f(&self.recorder.log.borrow())
    }
}

impl std::fmt::Debug for TraceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEngine")
            .field("mask", &self.mask)
            .field("active", &self.is_active())
            .field("events", &self.len())
            .finish()
    }
}

impl Drop for TraceEngine {
    fn drop(&mut self) {
        if self.restore() {
            debug!("Active trace engine dropped, hook restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;

    #[test]
    fn test_events_from_engine_sources_are_dropped() {
        let mut engine = TraceEngine::new(FieldMask::default(), Fallback::default());
        engine.start();
        {
            // sited in this file, which the engine ignores
            let frame = Frame::enter("internal", Site::new(file!(), line!()), &Bindings::new());
            frame.line(Site::new(file!(), line!()), &Bindings::new());
        }
        {
            let frame = Frame::enter("user", Site::new("user.rs", 1), &Bindings::new());
            frame.line(Site::new("user.rs", 2), &Bindings::new());
        }
        engine.stop_at(Site::new("user.rs", 99));

        let events = engine.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.filename.as_deref() == Some("user.rs")));
        assert!(engine.ignored_files().contains(&file!().to_string()));
    }

    #[test]
    fn test_selection_follows_mask() {
        let selection = Selection::from(&FieldMask::default());
        assert!(selection.event && selection.arg && selection.filename);
        assert!(selection.lineno && selection.locals);
        assert!(!selection.globals && !selection.function && !selection.frame_id);
        assert!(!selection.frame_back);
    }
}
