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

//! The user-facing tracer.
//!
//! A [`Tracer`] runs code under a [`TraceEngine`], either as a one-shot call
//! ([`Tracer::trace`]) or as a scope ([`Tracer::enter`]), and exposes the recorded
//! events, the linetrace and their JSON/CSV renderings.
//!
//! Errors escaping the traced code, panics included, never propagate out of the
//! tracer. They are recorded as an [`UncaughtException`] instead.

use std::{
    any::Any,
    collections::BTreeSet,
    convert::Infallible,
    fmt,
    panic::{self, AssertUnwindSafe},
    path::Path,
    thread,
};

use serde::{Deserialize, Serialize};
use spytrace_common::{
    fields,
    types::{EventKind, EventLog, FrameId, Snapshot},
    FieldMask,
};
use tracing::{debug, info};

use crate::{
    engine::RecordedEvent, linetrace, output, Fallback, Site, SourceResolver, TraceEngine,
    TraceError, TracerConfig,
};

pub(crate) const SOURCE_FILE: &str = file!();

/// One active frame at the point an error escaped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    /// Name of the instrumented function
    pub function: String,
    /// Source file of the frame's last reported position
    pub filename: String,
    /// Line of the frame's last reported position
    pub line_number: u32,
}

/// Frames active when an error escaped, outermost first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Traceback {
    frames: Vec<FrameSummary>,
}

impl Traceback {
    /// Frames, outermost first
    pub fn frames(&self) -> &[FrameSummary] {
        &self.frames
    }

    /// The frame the error was raised in
    pub fn innermost(&self) -> Option<&FrameSummary> {
        self.frames.last()
    }

    /// Whether no frame was active
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Rebuild the frame stack at the raise point from a recorded log.
    ///
    /// The raise point is the first exception event after the last call or line
    /// event, or that last call or line event when no exception was reported.
    fn from_records(records: &[RecordedEvent]) -> Self {
        let is_step =
            |record: &RecordedEvent| matches!(record.kind, EventKind::Call | EventKind::Line);
        let Some(last_step) = records.iter().rposition(is_step) else {
            return Self::default();
        };
        let raise_at = records[last_step..]
            .iter()
            .position(|record| record.kind == EventKind::Exception)
            .map_or(last_step, |offset| last_step + offset);

        let mut stack: Vec<(FrameId, FrameSummary)> = Vec::new();
        for record in &records[..=raise_at] {
            let summary = FrameSummary {
                function: record.function.to_string(),
                filename: record.site.file.to_string(),
                line_number: record.site.line,
            };
            match record.kind {
                EventKind::Call => stack.push((record.frame, summary)),
                EventKind::Return => {
                    if let Some(position) = stack.iter().rposition(|(id, _)| *id == record.frame) {
                        stack.truncate(position);
                    }
                }
                EventKind::Line | EventKind::Exception => {
                    match stack.iter_mut().rev().find(|(id, _)| *id == record.frame) {
                        Some((_, frame)) => *frame = summary,
                        // the frame was entered before tracing started
                        None => stack.push((record.frame, summary)),
                    }
                }
            }
        }

        Self { frames: stack.into_iter().map(|(_, frame)| frame).collect() }
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "  at {} ({}:{})", frame.function, frame.filename, frame.line_number)?;
        }
        Ok(())
    }
}

/// An error that escaped the traced code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncaughtException {
    /// Type of the error, or [`UncaughtException::PANIC`]
    pub type_name: String,
    /// Display rendering of the error, or the panic message
    pub value: String,
    /// Frames active at the raise point
    pub context: Traceback,
}

impl UncaughtException {
    /// Type name recorded for panics
    pub const PANIC: &'static str = "panic";

    /// The `(type, value, context)` triple
    pub fn parts(&self) -> (&str, &str, &Traceback) {
        (&self.type_name, &self.value, &self.context)
    }

    /// Whether the escaped error has type `E`
    pub fn is<E: ?Sized>(&self) -> bool {
        self.type_name == std::any::type_name::<E>()
    }

    /// Whether the traced code panicked
    pub fn is_panic(&self) -> bool {
        self.type_name == Self::PANIC
    }
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.value)
    }
}

/// How traced code ended, before the traceback is attached
type Settled<T> = Result<T, (String, String)>;

fn settle<T, E: fmt::Display>(outcome: thread::Result<Result<T, E>>) -> Settled<T> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err((std::any::type_name::<E>().to_string(), err.to_string())),
        Err(payload) => {
            Err((UncaughtException::PANIC.to_string(), panic_message(payload.as_ref())))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Traces instrumented code and renders what it recorded
#[derive(Debug)]
pub struct Tracer {
    engine: TraceEngine,
    sources: SourceResolver,
    uncaught_exception: Option<UncaughtException>,
    completed: bool,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::with_engine(
            TraceEngine::new(FieldMask::default(), Fallback::default()),
            SourceResolver::default(),
        )
    }
}

impl Tracer {
    /// Create a tracer capturing the attributes selected by `mask`.
    ///
    /// Fails with [`TraceError::UnknownField`] when the mask names an attribute
    /// that does not exist.
    pub fn new(mask: FieldMask, fallback: Fallback) -> Result<Self, TraceError> {
        mask.validate()?;
        Ok(Self::with_engine(TraceEngine::new(mask, fallback), SourceResolver::default()))
    }

    fn with_engine(engine: TraceEngine, sources: SourceResolver) -> Self {
        Self { engine, sources, uncaught_exception: None, completed: false }
    }

    /// Create a tracer from a validated configuration
    pub fn from_config(config: TracerConfig) -> Result<Self, TraceError> {
        config.fields.validate()?;

        let mut engine =
            TraceEngine::new(config.fields, config.fallback).with_cooperation(config.cooperate);
        for file in config.ignored_files {
            engine.ignore_file(file);
        }
        Ok(Self::with_engine(engine, SourceResolver::new(config.source_root)))
    }

    /// Resolve relative source file names against `root`
    pub fn with_source_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.sources = SourceResolver::new(Some(root.into()));
        self
    }

    /// Forward events to the hook installed before tracing started
    pub fn with_cooperation(mut self, cooperate: bool) -> Self {
        self.engine.set_cooperation(cooperate);
        self
    }

    /// Run `f` under the tracer, discarding anything recorded before.
    ///
    /// Returns the value `f` produced, or `None` when it failed or panicked; the
    /// failure is then available from [`Tracer::uncaught_exception`].
    #[track_caller]
    pub fn trace<T, E, F>(&mut self, f: F) -> Result<Option<T>, TraceError>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        let teardown = Site::caller();
        self.ensure_idle()?;
        self.reset();

        self.engine.start();
        let outcome = panic::catch_unwind(AssertUnwindSafe(f));
        self.engine.stop_at(teardown);
        self.completed = true;

        self.conclude(settle(outcome))
    }

    /// [`Tracer::trace`] for code that cannot fail other than by panicking
    #[track_caller]
    pub fn trace_infallible<T, F>(&mut self, f: F) -> Result<Option<T>, TraceError>
    where
        F: FnOnce() -> T,
    {
        self.trace(|| Ok::<T, Infallible>(f()))
    }

    /// Start tracing until the returned scope ends.
    ///
    /// Events accumulate across scopes; call [`Tracer::reset`] to discard them.
    pub fn enter(&mut self) -> Result<TraceScope<'_>, TraceError> {
        self.ensure_idle()?;
        self.engine.start();
        Ok(TraceScope { tracer: self, open: true })
    }

    /// Discard all recorded state
    pub fn reset(&mut self) {
        self.engine.clear();
        self.uncaught_exception = None;
        self.completed = false;
    }

    fn ensure_idle(&self) -> Result<(), TraceError> {
        if self.engine.is_active() {
            return Err(TraceError::AlreadyTracing);
        }
        Ok(())
    }

    /// Record the escaped error, if any, and surface the first capture failure
    fn conclude<T>(&mut self, settled: Settled<T>) -> Result<Option<T>, TraceError> {
        let value = match settled {
            Ok(value) => Some(value),
            Err((type_name, value)) => {
                self.record_uncaught(type_name, value);
                None
            }
        };

        if let Some(err) = self.engine.take_capture_error() {
            return Err(err.into());
        }
        Ok(value)
    }

    fn record_uncaught(&mut self, type_name: String, value: String) {
        let context = self.engine.with_records(Traceback::from_records);
        info!("Traced code raised {}: {}", type_name, value);
        self.uncaught_exception = Some(UncaughtException { type_name, value, context });
    }

    /// Whether a trace is running
    pub fn is_tracing(&self) -> bool {
        self.engine.is_active()
    }

    /// Whether a trace has finished since the last reset
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// The active field mask
    pub fn mask(&self) -> &FieldMask {
        self.engine.mask()
    }

    /// The error that escaped the last trace, if any
    pub fn uncaught_exception(&self) -> Option<&UncaughtException> {
        self.uncaught_exception.as_ref()
    }

    /// The underlying engine
    pub fn engine(&self) -> &TraceEngine {
        &self.engine
    }

    /// Recorded events, in emission order
    pub fn events(&self) -> EventLog {
        self.engine.events()
    }

    /// The linetrace of the recorded events
    pub fn snapshots(&self) -> Result<Vec<Snapshot>, TraceError> {
        self.engine.with_records(|records| {
            linetrace(records.iter().map(|record| &record.event), self.mask(), &self.sources)
        })
    }

    /// Distinct source files of the recorded events
    pub fn filenames(&self) -> Result<BTreeSet<String>, TraceError> {
        self.mask().require(fields::FILENAME)?;
        Ok(self.events().filenames())
    }

    /// The linetrace as a JSON array
    pub fn json(&self) -> Result<String, TraceError> {
        output::to_json(&self.snapshots()?)
    }

    /// The linetrace as CSV
    pub fn csv(&self) -> Result<String, TraceError> {
        output::to_csv(&self.snapshots()?)
    }

    /// The recorded events as a JSON array
    pub fn events_json(&self) -> Result<String, TraceError> {
        output::to_json(self.events().as_slice())
    }

    /// The recorded events as CSV
    pub fn events_csv(&self) -> Result<String, TraceError> {
        output::to_csv(self.events().as_slice())
    }

    /// Write [`Tracer::json`] to `path`
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        output::write_atomic(path, &self.json()?)
    }

    /// Write [`Tracer::csv`] to `path`
    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        output::write_atomic(path, &self.csv()?)
    }

    /// Write [`Tracer::events_json`] to `path`
    pub fn save_events_json(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        output::write_atomic(path, &self.events_json()?)
    }

    /// Write [`Tracer::events_csv`] to `path`
    pub fn save_events_csv(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        output::write_atomic(path, &self.events_csv()?)
    }
}

/// A running trace started by [`Tracer::enter`].
///
/// Ending the scope stops the engine. Dropping it during a panic records the
/// panic as the uncaught exception.
#[derive(Debug)]
pub struct TraceScope<'t> {
    tracer: &'t mut Tracer,
    open: bool,
}

impl TraceScope<'_> {
    /// End the scope with the outcome of the traced code
    #[track_caller]
    pub fn exit<T, E: fmt::Display>(
        mut self,
        outcome: Result<T, E>,
    ) -> Result<Option<T>, TraceError> {
        self.close(Site::caller());
        self.tracer.conclude(settle(Ok(outcome)))
    }

    /// End the scope normally
    #[track_caller]
    pub fn finish(self) -> Result<(), TraceError> {
        self.exit(Ok::<(), Infallible>(())).map(|_| ())
    }

    /// Run `f` inside the scope, then end it
    #[track_caller]
    pub fn run<T, E, F>(mut self, f: F) -> Result<Option<T>, TraceError>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        let teardown = Site::caller();
        let outcome = panic::catch_unwind(AssertUnwindSafe(f));
        self.close(teardown);
        self.tracer.conclude(settle(outcome))
    }

    /// Number of events recorded so far
    pub fn len(&self) -> usize {
        self.tracer.engine.len()
    }

    /// Whether nothing has been recorded so far
    pub fn is_empty(&self) -> bool {
        self.tracer.engine.is_empty()
    }

    fn close(&mut self, teardown: Site) {
        if self.open {
            self.open = false;
            self.tracer.engine.stop_at(teardown);
            self.tracer.completed = true;
        }
    }
}

impl Drop for TraceScope<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.close(Site::new(SOURCE_FILE, line!()));
        if thread::panicking() {
            debug!("Trace scope unwound by a panic");
            self.tracer.record_uncaught(
                UncaughtException::PANIC.to_string(),
                "panicked inside a trace scope".to_string(),
            );
        }
    }
}
