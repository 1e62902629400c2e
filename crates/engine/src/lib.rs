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

//! Spytrace Engine - Line-level execution tracing
//!
//! Instrumented code reports calls, lines, returns and errors through the
//! `trace_*!` macros. A [`Tracer`] records those reports while it is active and
//! rebuilds the linetrace: each executed line with its source text and the
//! variables live just before it ran.
//!
//! ```ignore
//! use spytrace_engine::{trace_call, trace_line, trace_return, Tracer};
//!
//! fn sum(n: u32) -> u32 {
//!     let frame = trace_call!("sum"; n);
//!     trace_line!(frame; n); let mut total = 0;
//!     trace_line!(frame; n, total); for i in 0..n { total += i; }
//!     trace_return!(frame, total; n, total);
//!     total
//! }
//!
//! let mut tracer = Tracer::default();
//! tracer.trace_infallible(|| sum(3))?;
//! println!("{}", tracer.json()?);
//! ```

pub mod config;
pub use config::*;

pub mod engine;
pub use engine::*;

/// Error types surfaced by the tracer
pub mod error;
pub use error::*;

pub mod frame;
pub use frame::*;

pub mod hook;
pub use hook::{RawEvent, TraceHook};

pub mod linetrace;
pub use linetrace::*;

pub mod macros;

pub mod output;
pub use output::*;

pub mod serialize;
pub use serialize::*;

pub mod tracer;
pub use tracer::*;

pub use spytrace_common::{
    fields,
    types::{EventKind, EventLog, FrameId, Snapshot, TraceEvent, Variables},
    FieldMask, RequiredFieldMissing, UnknownField,
};
