//! Render-safe timing for code swaps
//!
//! A scheduled swap waits two frame-callback boundaries of the host loop. The
//! first only guarantees the current callback phase is over; the second lands
//! at the start of a render pass, before anything for that pass is drawn.
//! Every request bumps the generation, and a continuation whose captured
//! generation is no longer current abandons itself, so only the latest
//! request within the window runs.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::event_loop::{Callback, EventLoop, FrameId};
use crate::protocol::SwapRequest;
use crate::value::Value;

/// Frame-callback boundaries a swap waits before it runs
pub const SWAP_DEFERRAL_TICKS: u32 = 2;

pub type ExecuteFn = Rc<dyn Fn(u64, SwapRequest)>;
pub type RenderProbe = Rc<dyn Fn() -> bool>;

/// Result of `FrameScheduler::schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub generation: u64,
    /// Generation of the pending request this one replaced, if any
    pub superseded: Option<u64>,
}

struct SchedulerState {
    host: Rc<EventLoop>,
    is_rendering: RenderProbe,
    on_execute: ExecuteFn,
    render_stall_warning: u32,
    generation: Cell<u64>,
    pending: RefCell<Option<(u64, SwapRequest)>>,
    frame: Cell<Option<FrameId>>,
    superseded: Cell<u64>,
}

#[derive(Clone)]
pub struct FrameScheduler {
    state: Rc<SchedulerState>,
}

impl FrameScheduler {
    pub fn new(
        host: Rc<EventLoop>,
        is_rendering: RenderProbe,
        on_execute: ExecuteFn,
        render_stall_warning: u32,
    ) -> Self {
        Self {
            state: Rc::new(SchedulerState {
                host,
                is_rendering,
                on_execute,
                render_stall_warning,
                generation: Cell::new(0),
                pending: RefCell::new(None),
                frame: Cell::new(None),
                superseded: Cell::new(0),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.generation.get()
    }

    pub fn has_pending(&self) -> bool {
        self.state.pending.borrow().is_some()
    }

    /// Requests dropped because a newer one arrived first
    pub fn superseded_count(&self) -> u64 {
        self.state.superseded.get()
    }

    pub fn schedule(&self, request: SwapRequest) -> ScheduleOutcome {
        let state = &self.state;
        let generation = state.generation.get() + 1;
        state.generation.set(generation);

        let superseded = state
            .pending
            .borrow_mut()
            .replace((generation, request))
            .map(|(previous, _)| previous);
        if let Some(previous) = superseded {
            state.superseded.set(state.superseded.get() + 1);
            log::debug!("swap {} superseded by {}", previous, generation);
        }

        defer(&self.state, generation, SWAP_DEFERRAL_TICKS, 0);
        ScheduleOutcome {
            generation,
            superseded,
        }
    }

    /// Drop the pending request without running it
    pub fn cancel(&self) {
        let state = &self.state;
        state.generation.set(state.generation.get() + 1);
        state.pending.borrow_mut().take();
        if let Some(frame) = state.frame.take() {
            state.host.cancel_frame(frame);
        }
    }
}

fn defer(state: &Rc<SchedulerState>, generation: u64, ticks: u32, deferrals: u32) {
    if let Some(previous) = state.frame.take() {
        state.host.cancel_frame(previous);
    }
    let weak = Rc::downgrade(state);
    let continuation: Callback = Rc::new(move |_| {
        step(&weak, generation, ticks, deferrals);
        Ok(Value::Nil)
    });
    state.frame.set(Some(state.host.request_frame(continuation)));
}

fn step(weak: &Weak<SchedulerState>, generation: u64, ticks: u32, deferrals: u32) {
    let Some(state) = weak.upgrade() else {
        return;
    };
    state.frame.set(None);
    if state.generation.get() != generation {
        return;
    }
    if ticks > 1 {
        defer(&state, generation, ticks - 1, deferrals);
        return;
    }

    // Never run mid-render; the request waits for as long as the pass lasts
    if (state.is_rendering)() {
        if deferrals == state.render_stall_warning {
            log::warn!(
                "render pass still in flight after {} deferrals, swap {} keeps waiting",
                deferrals,
                generation
            );
        } else {
            log::debug!("render pass in flight, deferring swap {}", generation);
        }
        defer(&state, generation, 1, deferrals.saturating_add(1));
        return;
    }

    let request = match state.pending.borrow_mut().take() {
        Some((pending, request)) if pending == generation => request,
        _ => return,
    };
    (state.on_execute)(generation, request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(16);

    struct Fixture {
        host: Rc<EventLoop>,
        scheduler: FrameScheduler,
        rendering: Rc<Cell<bool>>,
        executed: Rc<RefCell<Vec<(u64, String)>>>,
    }

    fn fixture(render_stall_warning: u32) -> Fixture {
        let host = Rc::new(EventLoop::new());
        let rendering = Rc::new(Cell::new(false));
        let executed = Rc::new(RefCell::new(Vec::new()));
        let probe = rendering.clone();
        let sink = executed.clone();
        let scheduler = FrameScheduler::new(
            host.clone(),
            Rc::new(move || probe.get()),
            Rc::new(move |generation, request: SwapRequest| {
                sink.borrow_mut().push((generation, request.code));
            }),
            render_stall_warning,
        );
        Fixture {
            host,
            scheduler,
            rendering,
            executed,
        }
    }

    #[test]
    fn test_swap_runs_on_second_tick() {
        let fx = fixture(8);
        let outcome = fx.scheduler.schedule(SwapRequest::run("a"));
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.superseded, None);

        fx.host.tick(TICK);
        assert!(fx.executed.borrow().is_empty());
        assert!(fx.scheduler.has_pending());
        fx.host.tick(TICK);
        assert_eq!(*fx.executed.borrow(), vec![(1, "a".to_string())]);
        assert!(!fx.scheduler.has_pending());
        assert_eq!(fx.host.pending_frames(), 0);
    }

    #[test]
    fn test_latest_request_wins() {
        let fx = fixture(8);
        fx.scheduler.schedule(SwapRequest::run("first"));
        let outcome = fx.scheduler.schedule(SwapRequest::run("second"));
        assert_eq!(outcome.superseded, Some(1));

        for _ in 0..4 {
            fx.host.tick(TICK);
        }
        assert_eq!(*fx.executed.borrow(), vec![(2, "second".to_string())]);
        assert_eq!(fx.scheduler.superseded_count(), 1);
    }

    #[test]
    fn test_request_arriving_mid_window_restarts_deferral() {
        let fx = fixture(8);
        fx.scheduler.schedule(SwapRequest::run("first"));
        fx.host.tick(TICK);
        fx.scheduler.schedule(SwapRequest::run("second"));
        fx.host.tick(TICK);
        assert!(fx.executed.borrow().is_empty());
        fx.host.tick(TICK);
        assert_eq!(fx.executed.borrow().len(), 1);
        assert_eq!(fx.executed.borrow()[0].1, "second");
    }

    #[test]
    fn test_cancel_drops_pending() {
        let fx = fixture(8);
        fx.scheduler.schedule(SwapRequest::run("a"));
        fx.scheduler.cancel();
        assert!(!fx.scheduler.has_pending());
        assert_eq!(fx.host.pending_frames(), 0);
        for _ in 0..3 {
            fx.host.tick(TICK);
        }
        assert!(fx.executed.borrow().is_empty());
    }

    #[test]
    fn test_rendering_defers_then_runs() {
        let fx = fixture(8);
        fx.rendering.set(true);
        fx.scheduler.schedule(SwapRequest::run("a"));
        for _ in 0..4 {
            fx.host.tick(TICK);
        }
        assert!(fx.executed.borrow().is_empty());
        fx.rendering.set(false);
        fx.host.tick(TICK);
        assert_eq!(fx.executed.borrow().len(), 1);
    }

    #[test]
    fn test_long_render_never_drops_swap() {
        let fx = fixture(2);
        fx.rendering.set(true);
        fx.scheduler.schedule(SwapRequest::run("a"));
        for _ in 0..12 {
            fx.host.tick(TICK);
        }
        assert!(fx.scheduler.has_pending());
        assert!(fx.executed.borrow().is_empty());
        assert_eq!(fx.host.pending_frames(), 1);

        fx.rendering.set(false);
        fx.host.tick(TICK);
        assert_eq!(*fx.executed.borrow(), vec![(1, "a".to_string())]);
        assert!(!fx.scheduler.has_pending());
    }
}
