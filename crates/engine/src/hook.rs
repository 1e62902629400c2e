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

//! The per-thread trace hook slot.
//!
//! At most one [`TraceHook`] is installed per thread. Installing a hook hands back
//! the one it displaced, so that whoever installs is also responsible for putting
//! the previous hook back.

use std::{cell::RefCell, rc::Rc};

use spytrace_common::types::EventKind;

use crate::{Bindings, FrameInfo, Site, Slot};

pub(crate) const SOURCE_FILE: &str = file!();

thread_local! {
    static ACTIVE_HOOK: RefCell<Option<Rc<dyn TraceHook>>> = const { RefCell::new(None) };
}

/// An event as emitted by instrumented code, before any capture
#[derive(Debug, Clone, Copy)]
pub struct RawEvent<'a> {
    /// Kind of the event
    pub kind: EventKind,
    /// Emission point
    pub site: Site,
    /// The emitting frame
    pub frame: &'a FrameInfo,
    /// Return value or error description
    pub arg: Option<Slot<'a>>,
    /// Local bindings
    pub locals: &'a Bindings<'a>,
}

/// Receiver of raw events on the thread it is installed on
pub trait TraceHook {
    /// Handle one event
    fn on_event(&self, event: &RawEvent<'_>);

    /// Replace `hook` with `replacement` wherever this hook keeps it as the hook
    /// it displaced, looking through the chain of displaced hooks.
    ///
    /// Called when `hook` is removed while it is no longer installed. Hooks that
    /// keep no displaced hook return `false`.
    fn unlink(&self, hook: &Rc<dyn TraceHook>, replacement: Option<Rc<dyn TraceHook>>) -> bool {
        let _ = (hook, replacement);
        false
    }
}

impl<F> TraceHook for F
where
    F: Fn(&RawEvent<'_>),
{
    fn on_event(&self, event: &RawEvent<'_>) {
        self(event)
    }
}

/// Install `hook` on the current thread, returning the hook it displaced
pub fn replace(hook: Option<Rc<dyn TraceHook>>) -> Option<Rc<dyn TraceHook>> {
    ACTIVE_HOOK.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), hook))
}

/// The hook installed on the current thread
pub fn current() -> Option<Rc<dyn TraceHook>> {
    ACTIVE_HOOK.try_with(|slot| slot.borrow().clone()).ok().flatten()
}

/// Whether any hook is installed on the current thread
pub fn is_installed() -> bool {
    ACTIVE_HOOK.try_with(|slot| slot.borrow().is_some()).unwrap_or(false)
}

/// Whether `a` and `b` are the same hook
pub fn same_hook(a: &Rc<dyn TraceHook>, b: &Rc<dyn TraceHook>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

/// Hand `event` to the installed hook, if any.
///
/// The slot is not borrowed while the hook runs, so hooks may themselves
/// replace the installed hook.
pub(crate) fn dispatch(event: &RawEvent<'_>) {
    if let Some(hook) = current() {
        hook.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::Frame;

    #[test]
    fn test_replace_returns_previous_hook() {
        let seen = Rc::new(Cell::new(0usize));
        let counter = seen.clone();
        let hook: Rc<dyn TraceHook> = Rc::new(move |_: &RawEvent<'_>| counter.set(counter.get() + 1));

        assert!(replace(Some(hook.clone())).is_none());
        assert!(is_installed());

        let frame = Frame::enter("f", Site::new("a.rs", 1), &Bindings::new());
        frame.line(Site::new("a.rs", 2), &Bindings::new());
        drop(frame);
        assert_eq!(seen.get(), 3);

        let previous = replace(None).unwrap();
        assert!(Rc::ptr_eq(&previous, &hook));
        assert!(!is_installed());

        // nothing is delivered once the slot is empty
        let _frame = Frame::enter("g", Site::new("a.rs", 1), &Bindings::new());
        assert_eq!(seen.get(), 3);
    }

    #[test]
    fn test_plain_hooks_do_not_unlink() {
        let first: Rc<dyn TraceHook> = Rc::new(|_: &RawEvent<'_>| {});
        let second: Rc<dyn TraceHook> = Rc::new(|_: &RawEvent<'_>| {});

        assert!(same_hook(&first, &first.clone()));
        assert!(!same_hook(&first, &second));
        assert!(!first.unlink(&second, None));
    }
}
