//! Cooperative host event loop
//!
//! A virtual clock advanced by `tick`. Everything the sandbox schedules
//! (timeouts, intervals, frame callbacks, event listeners) lives here, and
//! each tick runs, in order:
//!
//! 1. the frame-callback queue as it stood when the tick began,
//! 2. due timers and intervals, earliest first,
//! 3. the attached renderer.
//!
//! Callbacks never run while loop state is borrowed, so they are free to
//! schedule or cancel anything. Handles are never reused.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use crate::capability::Peripheral;
use crate::value::{NativeFn, Value};

pub type Callback = NativeFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Remove the listener after its first invocation
    pub once: bool,
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Timer {
    due: Duration,
    period: Option<Duration>,
    callback: Callback,
}

struct Listener {
    id: u64,
    target: String,
    event: String,
    callback: Callback,
    once: bool,
}

#[derive(Default)]
struct LoopState {
    now: Duration,
    ticks: u64,
    next_id: u64,
    timers: BTreeMap<u64, Timer>,
    frames: Vec<(u64, Callback)>,
    /// Frame callbacks of the tick in progress that have not run yet
    frame_batch: Vec<(u64, Callback)>,
    listeners: Vec<Listener>,
}

impl LoopState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct EventLoop {
    state: RefCell<LoopState>,
    renderer: RefCell<Option<Rc<dyn Peripheral>>>,
}

fn invoke(kind: &str, id: u64, callback: &Callback, args: &[Value]) {
    if let Err(e) = callback(args) {
        log::warn!("{} {} failed: {}", kind, id, e);
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// The peripheral whose `render_frame` closes every tick
    pub fn attach_renderer(&self, renderer: Rc<dyn Peripheral>) {
        *self.renderer.borrow_mut() = Some(renderer);
    }

    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    pub fn ticks(&self) -> u64 {
        self.state.borrow().ticks
    }

    pub fn set_timeout(&self, callback: Callback, delay: Duration) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        let due = state.now + delay;
        state.timers.insert(
            id,
            Timer {
                due,
                period: None,
                callback,
            },
        );
        TimerId(id)
    }

    pub fn clear_timeout(&self, id: TimerId) -> bool {
        self.state.borrow_mut().timers.remove(&id.0).is_some()
    }

    pub fn set_interval(&self, callback: Callback, period: Duration) -> TimerId {
        let period = period.max(MIN_INTERVAL);
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        let due = state.now + period;
        state.timers.insert(
            id,
            Timer {
                due,
                period: Some(period),
                callback,
            },
        );
        TimerId(id)
    }

    pub fn clear_interval(&self, id: TimerId) -> bool {
        self.clear_timeout(id)
    }

    /// Run `callback` once at the start of the next tick
    pub fn request_frame(&self, callback: Callback) -> FrameId {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.frames.push((id, callback));
        FrameId(id)
    }

    pub fn cancel_frame(&self, id: FrameId) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.frames.len() + state.frame_batch.len();
        state.frames.retain(|(frame, _)| *frame != id.0);
        state.frame_batch.retain(|(frame, _)| *frame != id.0);
        before != state.frames.len() + state.frame_batch.len()
    }

    pub fn add_listener(
        &self,
        target: &str,
        event: &str,
        callback: Callback,
        options: ListenerOptions,
    ) -> ListenerId {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.listeners.push(Listener {
            id,
            target: target.to_string(),
            event: event.to_string(),
            callback,
            once: options.once,
        });
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id != id.0);
        before != state.listeners.len()
    }

    /// Deliver an event to every listener registered for it; returns how many ran
    pub fn dispatch(&self, target: &str, event: &str, payload: Value) -> usize {
        let matching: Vec<(u64, Callback)> = self
            .state
            .borrow()
            .listeners
            .iter()
            .filter(|l| l.target == target && l.event == event)
            .map(|l| (l.id, l.callback.clone()))
            .collect();

        let mut delivered = 0;
        for (id, callback) in matching {
            {
                let mut state = self.state.borrow_mut();
                // Listeners removed by an earlier handler are skipped
                let Some(index) = state.listeners.iter().position(|l| l.id == id) else {
                    continue;
                };
                if state.listeners[index].once {
                    state.listeners.remove(index);
                }
            }
            invoke("listener", id, &callback, std::slice::from_ref(&payload));
            delivered += 1;
        }
        delivered
    }

    /// Advance the virtual clock by `elapsed` and run everything that is due
    pub fn tick(&self, elapsed: Duration) {
        let (now, id_limit) = {
            let mut state = self.state.borrow_mut();
            state.now += elapsed;
            state.ticks += 1;
            let batch = std::mem::take(&mut state.frames);
            state.frame_batch = batch;
            (state.now, state.next_id)
        };

        let now_ms = Value::Float(now.as_secs_f64() * 1000.0);
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                if state.frame_batch.is_empty() {
                    None
                } else {
                    Some(state.frame_batch.remove(0))
                }
            };
            let Some((id, callback)) = next else { break };
            invoke("frame callback", id, &callback, std::slice::from_ref(&now_ms));
        }

        // Timers created during this tick wait for the next one
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let due = state
                    .timers
                    .iter()
                    .filter(|(id, t)| **id <= id_limit && t.due <= now)
                    .min_by_key(|(id, t)| (t.due, **id))
                    .map(|(id, _)| *id);
                match due {
                    None => None,
                    Some(id) => {
                        let periodic = state.timers.get(&id).and_then(|t| t.period);
                        match periodic {
                            Some(period) => state.timers.get_mut(&id).map(|timer| {
                                timer.due = (timer.due + period).max(now + period);
                                (id, "interval", timer.callback.clone())
                            }),
                            None => state
                                .timers
                                .remove(&id)
                                .map(|timer| (id, "timeout", timer.callback)),
                        }
                    }
                }
            };
            let Some((id, kind, callback)) = next else { break };
            invoke(kind, id, &callback, &[]);
        }

        let renderer = self.renderer.borrow().clone();
        if let Some(renderer) = renderer {
            renderer.render_frame(now);
        }
    }

    pub fn live_timers(&self) -> usize {
        self.state
            .borrow()
            .timers
            .values()
            .filter(|t| t.period.is_none())
            .count()
    }

    pub fn live_intervals(&self) -> usize {
        self.state
            .borrow()
            .timers
            .values()
            .filter(|t| t.period.is_some())
            .count()
    }

    pub fn pending_frames(&self) -> usize {
        let state = self.state.borrow();
        state.frames.len() + state.frame_batch.len()
    }

    pub fn live_listeners(&self) -> usize {
        self.state.borrow().listeners.len()
    }
}
