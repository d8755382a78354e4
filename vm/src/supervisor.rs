//! Hot-swap supervisor
//!
//! Owns everything scoped to the running generation (resource arena, draw
//! guard, retained dispose callback) and the last revision known to run
//! cleanly. A swap runs as pause, validate, clean, execute, then commit or
//! roll back, and the peripheral is always resumed afterwards.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Serialize;

use crate::arena::ResourceArena;
use crate::capability::{CapabilityTable, Peripheral};
use crate::config::SandboxConfig;
use crate::draw_guard::DrawGuard;
use crate::error::{SandboxError, SourceMap};
use crate::event_loop::EventLoop;
use crate::execution::{ExecutionContext, ExecutionResult, SandboxBindings};
use crate::protocol::{StatusBus, StatusReport, SwapRequest};
use crate::scheduler::{FrameScheduler, ScheduleOutcome};

/// Where the supervisor is in the swap sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    /// Nothing pending
    Idle,
    /// A request waits in the frame scheduler
    Scheduled,
    Validating,
    /// The revision failed to parse; nothing was touched
    Rejected,
    /// Tearing down the previous generation
    Cleaning,
    Executing,
    Committed,
    RollingBack,
    /// Shut down; further requests are refused
    Disposed,
}

/// Resources and fault state of the running generation
struct Generation {
    arena: Rc<ResourceArena>,
    guard: DrawGuard,
}

/// Pauses the peripheral for its lifetime
struct RenderPause<'a> {
    peripheral: &'a dyn Peripheral,
}

impl<'a> RenderPause<'a> {
    fn new(peripheral: &'a dyn Peripheral) -> Self {
        peripheral.pause();
        Self { peripheral }
    }
}

impl Drop for RenderPause<'_> {
    fn drop(&mut self) {
        self.peripheral.resume();
    }
}

pub struct Supervisor {
    config: SandboxConfig,
    host: Rc<EventLoop>,
    peripheral: Rc<dyn Peripheral>,
    data_sources: CapabilityTable,
    bus: Rc<StatusBus>,
    scheduler: FrameScheduler,
    context: ExecutionContext,
    current: RefCell<Generation>,
    phase: Cell<SwapPhase>,
    last_working: RefCell<Option<String>>,
    initialized: Cell<bool>,
    swaps: Cell<u64>,
    rollbacks: Cell<u64>,
}

impl Supervisor {
    pub fn new(
        config: SandboxConfig,
        host: Rc<EventLoop>,
        peripheral: Rc<dyn Peripheral>,
        data_sources: CapabilityTable,
        bus: Rc<StatusBus>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak: &std::rc::Weak<Self>| {
            let supervisor = weak.clone();
            let probe = peripheral.clone();
            let scheduler = FrameScheduler::new(
                host.clone(),
                Rc::new(move || probe.is_rendering()),
                Rc::new(move |generation, request| {
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.run_swap(generation, request);
                    }
                }),
                config.render_stall_warning,
            );

            let current = Generation {
                arena: Rc::new(ResourceArena::new(0, host.clone())),
                guard: DrawGuard::new(0, bus.clone(), &config, SourceMap::new("")),
            };

            Self {
                context: ExecutionContext::new(config.limits, &data_sources),
                config,
                host,
                peripheral,
                data_sources,
                bus,
                scheduler,
                current: RefCell::new(current),
                phase: Cell::new(SwapPhase::Idle),
                last_working: RefCell::new(None),
                initialized: Cell::new(false),
                swaps: Cell::new(0),
                rollbacks: Cell::new(0),
            }
        })
    }

    /// Announce readiness on the status bus; later calls are no-ops
    pub fn init(&self) {
        if self.initialized.replace(true) {
            return;
        }
        log::info!(
            "sandbox ready, globals: {}",
            self.context.param_names().join(" ")
        );
        self.bus.emit(StatusReport::Ready);
    }

    pub fn submit(&self, request: SwapRequest) -> Result<ScheduleOutcome, SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }
        let outcome = self.scheduler.schedule(request);
        self.phase.set(SwapPhase::Scheduled);
        Ok(outcome)
    }

    pub fn phase(&self) -> SwapPhase {
        self.phase.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.phase.get() == SwapPhase::Disposed
    }

    /// Generation of the most recently scheduled swap
    pub fn generation(&self) -> u64 {
        self.scheduler.generation()
    }

    pub fn last_working_revision(&self) -> Option<String> {
        self.last_working.borrow().clone()
    }

    pub fn has_frame_fault(&self) -> bool {
        self.current.borrow().guard.has_frame_fault()
    }

    pub fn has_pending_swap(&self) -> bool {
        self.scheduler.has_pending()
    }

    /// Resources still tracked for the running generation
    pub fn tracked_resources(&self) -> usize {
        self.current.borrow().arena.len()
    }

    /// Swaps that reached the execute step
    pub fn swap_count(&self) -> u64 {
        self.swaps.get()
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.get()
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    fn run_swap(&self, generation: u64, request: SwapRequest) {
        if self.is_disposed() {
            return;
        }
        let _pause = RenderPause::new(&*self.peripheral);

        self.phase.set(SwapPhase::Validating);
        let check = self.context.validate_syntax(&request.code);
        if !check.valid {
            self.phase.set(SwapPhase::Rejected);
            if let Some(error) = check.error {
                log::warn!("swap {} rejected: {}", generation, error);
                self.bus.emit(StatusReport::RunError(error));
            }
            self.settle();
            return;
        }

        self.phase.set(SwapPhase::Cleaning);
        self.clean(generation, &request.code, request.is_soft_reset);

        self.phase.set(SwapPhase::Executing);
        self.swaps.set(self.swaps.get() + 1);
        let result = self.execute(&request.code);
        if result.success {
            *self.last_working.borrow_mut() = Some(request.code);
            self.phase.set(SwapPhase::Committed);
            log::info!("generation {} committed", generation);
            self.bus.emit(StatusReport::run_ok());
            self.settle();
            return;
        }

        if let Some(error) = result.error {
            log::warn!("generation {} failed: {}", generation, error);
            self.bus.emit(StatusReport::RunError(error));
        }

        let previous = self.last_working_revision();
        match previous {
            Some(previous) if self.config.rollback && previous != request.code => {
                self.phase.set(SwapPhase::RollingBack);
                self.rollbacks.set(self.rollbacks.get() + 1);
                self.clean(generation, &previous, false);
                let result = self.execute(&previous);
                match result.error {
                    None => log::info!("generation {} rolled back to last working revision", generation),
                    Some(error) => log::error!(
                        "rollback of generation {} failed, not retrying: {}",
                        generation,
                        error
                    ),
                }
            }
            _ => {}
        }
        self.settle();
    }

    fn settle(&self) {
        let phase = if self.scheduler.has_pending() {
            SwapPhase::Scheduled
        } else {
            SwapPhase::Idle
        };
        self.phase.set(phase);
    }

    /// Release the running generation and install a fresh one for `code`
    fn clean(&self, generation: u64, code: &str, soft_reset: bool) {
        let (arena, guard) = {
            let current = self.current.borrow();
            (current.arena.clone(), current.guard.clone())
        };
        guard.retire();
        let summary = arena.dispose();
        if summary.failures > 0 {
            log::warn!(
                "{} teardown(s) of generation {} failed",
                summary.failures,
                arena.generation()
            );
        }

        self.clear_frame_callbacks();
        self.peripheral.reset_sub_objects();
        if soft_reset {
            self.peripheral.reset_clock();
        }

        *self.current.borrow_mut() = Generation {
            arena: Rc::new(ResourceArena::new(generation, self.host.clone())),
            guard: DrawGuard::new(generation, self.bus.clone(), &self.config, SourceMap::new(code)),
        };
    }

    fn clear_frame_callbacks(&self) {
        self.peripheral.clear_frame_callbacks();
        for object in self.peripheral.sub_objects() {
            object.clear_frame_callbacks();
        }
    }

    fn execute(&self, code: &str) -> ExecutionResult {
        let bindings = {
            let current = self.current.borrow();
            SandboxBindings {
                arena: current.arena.clone(),
                guard: current.guard.clone(),
                host: self.host.clone(),
                peripheral: self.peripheral.clone(),
                data_sources: self.data_sources.clone(),
                bus: self.bus.clone(),
                limits: self.config.limits,
                source_map: SourceMap::new(code),
            }
        };
        self.context.execute(code, &bindings)
    }

    /// Shut down: cancel pending swaps and release the running generation
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        self.phase.set(SwapPhase::Disposed);
        self.scheduler.cancel();

        let (arena, guard) = {
            let current = self.current.borrow();
            (current.arena.clone(), current.guard.clone())
        };
        guard.retire();
        let summary = arena.dispose();
        self.context.run_dispose_callback();
        self.clear_frame_callbacks();
        log::info!(
            "sandbox disposed, released {} resource(s) of generation {}",
            summary.total(),
            arena.generation()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, Reply};
    use crate::headless::HeadlessPeripheral;
    use crate::value::Value;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(16);

    /// Claims a render pass is in flight for its first `busy` frames
    struct SlowRender {
        inner: Rc<HeadlessPeripheral>,
        busy: Cell<u32>,
    }

    impl Capability for SlowRender {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String> {
            self.inner.call(method, args)
        }

        fn clear_frame_callbacks(&self) {
            self.inner.clear_frame_callbacks()
        }
    }

    impl Peripheral for SlowRender {
        fn pause(&self) {
            self.inner.pause()
        }

        fn resume(&self) {
            self.inner.resume()
        }

        fn is_paused(&self) -> bool {
            self.inner.is_paused()
        }

        fn is_rendering(&self) -> bool {
            self.busy.get() > 0 || self.inner.is_rendering()
        }

        fn reset_clock(&self) {
            self.inner.reset_clock()
        }

        fn render_frame(&self, now: Duration) {
            self.busy.set(self.busy.get().saturating_sub(1));
            self.inner.render_frame(now)
        }

        fn frame_count(&self) -> u64 {
            self.inner.frame_count()
        }

        fn elapsed(&self) -> Duration {
            self.inner.elapsed()
        }

        fn sub_objects(&self) -> Vec<Rc<dyn Capability>> {
            self.inner.sub_objects()
        }
    }

    fn setup() -> (Rc<Supervisor>, Rc<EventLoop>, Rc<RefCell<Vec<StatusReport>>>) {
        let host = Rc::new(EventLoop::new());
        let bus = Rc::new(StatusBus::new());
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        bus.subscribe(move |r| sink.borrow_mut().push(r.clone()));
        let canvas = Rc::new(HeadlessPeripheral::new(32, 32, bus.clone()));
        host.attach_renderer(canvas.clone());
        let supervisor = Supervisor::new(
            SandboxConfig::default(),
            host.clone(),
            canvas,
            CapabilityTable::new(),
            bus,
        );
        supervisor.init();
        (supervisor, host, reports)
    }

    fn settle(host: &EventLoop) {
        host.tick(TICK);
        host.tick(TICK);
    }

    #[test]
    fn test_init_emits_ready_once() {
        let (supervisor, _, reports) = setup();
        supervisor.init();
        assert_eq!(*reports.borrow(), vec![StatusReport::Ready]);
        assert_eq!(supervisor.phase(), SwapPhase::Idle);
    }

    #[test]
    fn test_commit_records_last_working() {
        let (supervisor, host, reports) = setup();
        let outcome = supervisor.submit(SwapRequest::run("(define x 1)")).unwrap();
        assert_eq!(outcome.generation, 1);
        assert_eq!(supervisor.phase(), SwapPhase::Scheduled);
        settle(&host);
        assert_eq!(supervisor.phase(), SwapPhase::Idle);
        assert_eq!(supervisor.last_working_revision().as_deref(), Some("(define x 1)"));
        assert!(matches!(reports.borrow().last(), Some(StatusReport::RunOk { .. })));
    }

    #[test]
    fn test_rollback_is_bounded() {
        let (supervisor, host, _) = setup();
        supervisor.submit(SwapRequest::run("(define x 1)")).unwrap();
        settle(&host);
        supervisor.submit(SwapRequest::run("(error \"nope\")")).unwrap();
        settle(&host);
        assert_eq!(supervisor.rollback_count(), 1);
        assert_eq!(supervisor.last_working_revision().as_deref(), Some("(define x 1)"));

        // A failing revision with nothing to roll back to
        let (fresh, host, _) = setup();
        fresh.submit(SwapRequest::run("(error \"nope\")")).unwrap();
        settle(&host);
        assert_eq!(fresh.rollback_count(), 0);
        assert_eq!(fresh.last_working_revision(), None);
    }

    #[test]
    fn test_swap_waits_out_a_long_render() {
        let host = Rc::new(EventLoop::new());
        let bus = Rc::new(StatusBus::new());
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        bus.subscribe(move |r| sink.borrow_mut().push(r.clone()));
        let canvas = Rc::new(SlowRender {
            inner: Rc::new(HeadlessPeripheral::new(32, 32, bus.clone())),
            busy: Cell::new(12),
        });
        host.attach_renderer(canvas.clone());
        let config = SandboxConfig {
            render_stall_warning: 2,
            ..SandboxConfig::default()
        };
        let supervisor = Supervisor::new(config, host.clone(), canvas, CapabilityTable::new(), bus);
        supervisor.init();

        supervisor.submit(SwapRequest::run("(define x 1)")).unwrap();
        for _ in 0..12 {
            host.tick(TICK);
        }
        assert_eq!(supervisor.swap_count(), 0);
        assert!(supervisor.has_pending_swap());
        assert_eq!(supervisor.phase(), SwapPhase::Scheduled);

        for _ in 0..4 {
            host.tick(TICK);
        }
        assert_eq!(supervisor.swap_count(), 1);
        assert!(!supervisor.has_pending_swap());
        assert_eq!(supervisor.phase(), SwapPhase::Idle);
        assert_eq!(supervisor.last_working_revision().as_deref(), Some("(define x 1)"));
        assert!(matches!(reports.borrow().last(), Some(StatusReport::RunOk { .. })));
    }

    #[test]
    fn test_dispose_refuses_further_requests() {
        let (supervisor, host, _) = setup();
        supervisor
            .submit(SwapRequest::run("(set-interval (fn () nil) 10)"))
            .unwrap();
        settle(&host);
        assert_eq!(supervisor.tracked_resources(), 1);
        supervisor.submit(SwapRequest::run("(define y 2)")).unwrap();
        supervisor.dispose();
        assert_eq!(host.live_intervals(), 0);
        assert_eq!(host.pending_frames(), 0);
        assert!(matches!(
            supervisor.submit(SwapRequest::run("(define z 3)")),
            Err(SandboxError::Disposed)
        ));
        settle(&host);
        assert_eq!(supervisor.swap_count(), 1);
    }
}
