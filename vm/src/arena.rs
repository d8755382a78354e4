//! Per-generation resource tracking
//!
//! Every cancellable resource a generation creates is registered here and
//! released exactly once: either by the user cancelling it (untrack, then
//! release through the host) or by `dispose` when the next generation begins.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::evaluator::panic_message;
use crate::event_loop::{EventLoop, FrameId, ListenerId, ListenerOptions, TimerId};
use crate::value::Value;

/// An event subscription as registered by user code
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: ListenerId,
    pub target: String,
    pub event: String,
    pub handler: Value,
    pub options: ListenerOptions,
}

/// One resource owned by a generation, in release order
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedResource {
    Timeout(TimerId),
    Interval(TimerId),
    Frame(FrameId),
    Listener(Subscription),
    Teardown,
}

type Teardown = Box<dyn FnOnce() -> Result<(), String>>;

#[derive(Default)]
struct Tracked {
    timeouts: BTreeSet<TimerId>,
    intervals: BTreeSet<TimerId>,
    frames: BTreeSet<FrameId>,
    listeners: BTreeMap<ListenerId, Subscription>,
    teardowns: Vec<Teardown>,
}

/// What a `dispose` call released
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DisposeSummary {
    pub timeouts: usize,
    pub intervals: usize,
    pub frames: usize,
    pub listeners: usize,
    pub teardowns: usize,
    /// Teardowns that failed; logged, never propagated
    pub failures: usize,
}

impl DisposeSummary {
    pub fn total(&self) -> usize {
        self.timeouts + self.intervals + self.frames + self.listeners + self.teardowns
    }
}

pub struct ResourceArena {
    generation: u64,
    host: Rc<EventLoop>,
    tracked: RefCell<Tracked>,
    disposed: Cell<bool>,
}

impl fmt::Debug for ResourceArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceArena")
            .field("generation", &self.generation)
            .field("tracked", &self.len())
            .field("disposed", &self.disposed.get())
            .finish()
    }
}

impl ResourceArena {
    pub fn new(generation: u64, host: Rc<EventLoop>) -> Self {
        Self {
            generation,
            host,
            tracked: RefCell::new(Tracked::default()),
            disposed: Cell::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub fn track_timeout(&self, id: TimerId) -> TimerId {
        if self.is_disposed() {
            log::warn!("generation {} already disposed, releasing timeout {:?}", self.generation, id);
            self.host.clear_timeout(id);
        } else {
            self.tracked.borrow_mut().timeouts.insert(id);
        }
        id
    }

    pub fn untrack_timeout(&self, id: TimerId) -> bool {
        self.tracked.borrow_mut().timeouts.remove(&id)
    }

    pub fn track_interval(&self, id: TimerId) -> TimerId {
        if self.is_disposed() {
            log::warn!("generation {} already disposed, releasing interval {:?}", self.generation, id);
            self.host.clear_interval(id);
        } else {
            self.tracked.borrow_mut().intervals.insert(id);
        }
        id
    }

    pub fn untrack_interval(&self, id: TimerId) -> bool {
        self.tracked.borrow_mut().intervals.remove(&id)
    }

    pub fn track_frame(&self, id: FrameId) -> FrameId {
        if self.is_disposed() {
            log::warn!("generation {} already disposed, releasing frame {:?}", self.generation, id);
            self.host.cancel_frame(id);
        } else {
            self.tracked.borrow_mut().frames.insert(id);
        }
        id
    }

    pub fn untrack_frame(&self, id: FrameId) -> bool {
        self.tracked.borrow_mut().frames.remove(&id)
    }

    pub fn track_listener(&self, subscription: Subscription) -> ListenerId {
        let id = subscription.id;
        if self.is_disposed() {
            log::warn!("generation {} already disposed, releasing listener {:?}", self.generation, id);
            self.host.remove_listener(id);
        } else {
            self.tracked.borrow_mut().listeners.insert(id, subscription);
        }
        id
    }

    pub fn untrack_listener(&self, id: ListenerId) -> Option<Subscription> {
        self.tracked.borrow_mut().listeners.remove(&id)
    }

    /// Register a custom teardown routine
    pub fn on_dispose<F>(&self, teardown: F)
    where
        F: FnOnce() -> Result<(), String> + 'static,
    {
        if self.is_disposed() {
            run_teardown(self.generation, Box::new(teardown));
        } else {
            self.tracked.borrow_mut().teardowns.push(Box::new(teardown));
        }
    }

    pub fn resources(&self) -> Vec<TrackedResource> {
        let tracked = self.tracked.borrow();
        let mut resources = Vec::with_capacity(self.len());
        resources.extend(tracked.timeouts.iter().map(|id| TrackedResource::Timeout(*id)));
        resources.extend(tracked.intervals.iter().map(|id| TrackedResource::Interval(*id)));
        resources.extend(tracked.frames.iter().map(|id| TrackedResource::Frame(*id)));
        resources.extend(tracked.listeners.values().cloned().map(TrackedResource::Listener));
        resources.extend(tracked.teardowns.iter().map(|_| TrackedResource::Teardown));
        resources
    }

    pub fn len(&self) -> usize {
        let tracked = self.tracked.borrow();
        tracked.timeouts.len()
            + tracked.intervals.len()
            + tracked.frames.len()
            + tracked.listeners.len()
            + tracked.teardowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every tracked resource; never fails and is safe to repeat
    pub fn dispose(&self) -> DisposeSummary {
        self.disposed.set(true);
        let tracked = std::mem::take(&mut *self.tracked.borrow_mut());
        let mut summary = DisposeSummary::default();

        for id in tracked.timeouts {
            self.host.clear_timeout(id);
            summary.timeouts += 1;
        }
        for id in tracked.intervals {
            self.host.clear_interval(id);
            summary.intervals += 1;
        }
        for id in tracked.frames {
            self.host.cancel_frame(id);
            summary.frames += 1;
        }
        for id in tracked.listeners.into_keys() {
            self.host.remove_listener(id);
            summary.listeners += 1;
        }
        for teardown in tracked.teardowns {
            summary.teardowns += 1;
            if !run_teardown(self.generation, teardown) {
                summary.failures += 1;
            }
        }

        if summary.total() > 0 {
            log::debug!("generation {} released {:?}", self.generation, summary);
        }
        summary
    }
}

fn run_teardown(generation: u64, teardown: Teardown) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(teardown)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("teardown in generation {} failed: {}", generation, e);
            false
        }
        Err(payload) => {
            log::error!(
                "teardown in generation {} panicked: {}",
                generation,
                panic_message(payload.as_ref())
            );
            false
        }
    }
}
