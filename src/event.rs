//! One-shot completion events with attachable continuations.
//!
//! An [`Event`] is the concurrency primitive of the engine: an opaque handle
//! that becomes "triggered" exactly once. Code never blocks on an event;
//! instead it attaches a continuation that the dispatcher runs after the
//! trigger. A [`UserEvent`] is the writable side handed to whichever stage
//! owns the completion.
//!
//! Attaching to an already-triggered event enqueues the continuation
//! immediately; continuations never run inline on the attaching thread, so
//! callers may attach while holding locks.

use crate::dispatch::{Dispatcher, Priority};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Continuation = Box<dyn FnOnce() + Send>;

enum EventState {
    Triggered,
    Pending(Vec<(Priority, Continuation)>),
}

struct EventInner {
    dispatcher: Dispatcher,
    state: Mutex<EventState>,
}

/// A one-shot asynchronous completion signal.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Creates an event that has already triggered.
    #[must_use]
    pub fn triggered(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: Arc::new(EventInner {
                dispatcher: dispatcher.clone(),
                state: Mutex::new(EventState::Triggered),
            }),
        }
    }

    /// Returns true if the event has triggered.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        matches!(*self.inner.state.lock(), EventState::Triggered)
    }

    /// Attaches a continuation to run (via the dispatcher) once the event
    /// triggers. Runs immediately via the dispatcher if already triggered.
    pub fn attach<F>(&self, priority: Priority, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            EventState::Triggered => {
                drop(state);
                self.inner.dispatcher.enqueue(priority, continuation);
            }
            EventState::Pending(waiters) => {
                waiters.push((priority, Box::new(continuation)));
            }
        }
    }

    /// Merges a set of events into one that triggers after all of them.
    ///
    /// An empty set yields an already-triggered event.
    #[must_use]
    pub fn merge(dispatcher: &Dispatcher, events: &[Event]) -> Event {
        if events.is_empty() {
            return Self::triggered(dispatcher);
        }
        let merged = UserEvent::new(dispatcher);
        let remaining = Arc::new(AtomicUsize::new(events.len()));
        for event in events {
            let remaining = Arc::clone(&remaining);
            let merged = merged.clone();
            event.attach(Priority::Work, move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    merged.trigger();
                }
            });
        }
        merged.event()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Event(triggered={})", self.has_triggered())
    }
}

/// The writable side of an [`Event`].
#[derive(Clone)]
pub struct UserEvent {
    inner: Arc<EventInner>,
}

impl UserEvent {
    /// Creates a new untriggered event.
    #[must_use]
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: Arc::new(EventInner {
                dispatcher: dispatcher.clone(),
                state: Mutex::new(EventState::Pending(Vec::new())),
            }),
        }
    }

    /// Returns the readable handle for this event.
    #[must_use]
    pub fn event(&self) -> Event {
        Event {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns true if already triggered.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        matches!(*self.inner.state.lock(), EventState::Triggered)
    }

    /// Triggers the event, releasing all attached continuations to the
    /// dispatcher. Returns false if the event had already triggered
    /// (idempotent; quash paths may race the regular completion path).
    pub fn trigger(&self) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match core::mem::replace(&mut *state, EventState::Triggered) {
                EventState::Triggered => return false,
                EventState::Pending(waiters) => waiters,
            }
        };
        for (priority, continuation) in waiters {
            self.inner.dispatcher.enqueue(priority, continuation);
        }
        true
    }
}

impl core::fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "UserEvent(triggered={})", self.has_triggered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn continuation_runs_after_trigger() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));
        let user = UserEvent::new(&dispatcher);

        let flag = Arc::clone(&fired);
        user.event()
            .attach(Priority::Work, move || flag.store(true, Ordering::SeqCst));

        dispatcher.run_until_quiescent();
        assert!(!fired.load(Ordering::SeqCst));

        assert!(user.trigger());
        dispatcher.run_until_quiescent();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn attach_after_trigger_still_runs() {
        let dispatcher = Dispatcher::new();
        let user = UserEvent::new(&dispatcher);
        user.trigger();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        user.event()
            .attach(Priority::Work, move || flag.store(true, Ordering::SeqCst));
        dispatcher.run_until_quiescent();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn trigger_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let user = UserEvent::new(&dispatcher);
        assert!(user.trigger());
        assert!(!user.trigger());
    }

    #[test]
    fn merge_waits_for_all_components() {
        let dispatcher = Dispatcher::new();
        let a = UserEvent::new(&dispatcher);
        let b = UserEvent::new(&dispatcher);
        let merged = Event::merge(&dispatcher, &[a.event(), b.event()]);

        a.trigger();
        dispatcher.run_until_quiescent();
        assert!(!merged.has_triggered());

        b.trigger();
        dispatcher.run_until_quiescent();
        assert!(merged.has_triggered());
    }

    #[test]
    fn merge_of_nothing_is_triggered() {
        let dispatcher = Dispatcher::new();
        assert!(Event::merge(&dispatcher, &[]).has_triggered());
    }
}
