//! Priority-laned dispatcher for pipeline stage work.
//!
//! Pipeline stage transitions are never invoked inline: every `trigger_*`
//! call is enqueued here as an independent work item, so two operations'
//! mapping stages may run concurrently on different workers and no lock is
//! ever held across a stage boundary.
//!
//! The dispatcher has three lanes drained in priority order, plus a
//! lock-free injector so any thread (including one currently holding an
//! operation lock) can enqueue without contending on the lane lock.

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Dispatch priority for a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Background work (deferred reclamation, diagnostics).
    Low,
    /// Default throughput work (most pipeline stages).
    Work,
    /// Latency-sensitive work (resolution notifications, quash propagation).
    High,
}

type WorkItem = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Lanes {
    high: VecDeque<WorkItem>,
    work: VecDeque<WorkItem>,
    low: VecDeque<WorkItem>,
}

struct DispatchInner {
    injector: SegQueue<(Priority, WorkItem)>,
    lanes: Mutex<Lanes>,
}

/// A shared handle to the work dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a new empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                injector: SegQueue::new(),
                lanes: Mutex::new(Lanes::default()),
            }),
        }
    }

    /// Enqueues a work item at the given priority.
    pub fn enqueue<F>(&self, priority: Priority, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.injector.push((priority, Box::new(work)));
    }

    fn drain_injector(&self, lanes: &mut Lanes) {
        while let Some((priority, work)) = self.inner.injector.pop() {
            match priority {
                Priority::High => lanes.high.push_back(work),
                Priority::Work => lanes.work.push_back(work),
                Priority::Low => lanes.low.push_back(work),
            }
        }
    }

    /// Runs one work item, highest lane first.
    ///
    /// Returns false when no work was available. The item runs after the
    /// lane lock is released, so work items are free to enqueue more work.
    pub fn run_one(&self) -> bool {
        let work = {
            let mut lanes = self.inner.lanes.lock();
            self.drain_injector(&mut lanes);
            lanes
                .high
                .pop_front()
                .or_else(|| lanes.work.pop_front())
                .or_else(|| lanes.low.pop_front())
        };
        match work {
            Some(work) => {
                work();
                true
            }
            None => false,
        }
    }

    /// Runs work items until the dispatcher is empty, returning how many
    /// items ran. Items enqueued by running items are included.
    pub fn run_until_quiescent(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Returns the number of currently queued work items.
    #[must_use]
    pub fn pending(&self) -> usize {
        let mut lanes = self.inner.lanes.lock();
        self.drain_injector(&mut lanes);
        lanes.high.len() + lanes.work.len() + lanes.low.len()
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_in_priority_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [
            (Priority::Low, "low"),
            (Priority::Work, "work"),
            (Priority::High, "high"),
        ] {
            let order = Arc::clone(&order);
            dispatcher.enqueue(priority, move || order.lock().push(tag));
        }
        assert_eq!(dispatcher.run_until_quiescent(), 3);
        assert_eq!(*order.lock(), vec!["high", "work", "low"]);
    }

    #[test]
    fn work_items_may_enqueue_more_work() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_count = Arc::clone(&count);
        let inner_dispatcher = dispatcher.clone();
        dispatcher.enqueue(Priority::Work, move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let inner_count = Arc::clone(&inner_count);
            inner_dispatcher.enqueue(Priority::Work, move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(dispatcher.run_until_quiescent(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_one_reports_emptiness() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.run_one());
        dispatcher.enqueue(Priority::Work, || {});
        assert_eq!(dispatcher.pending(), 1);
        assert!(dispatcher.run_one());
        assert!(!dispatcher.run_one());
    }
}
