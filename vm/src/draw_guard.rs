//! Frame-fault isolation for per-frame callbacks
//!
//! A guarded callback that fails sets the generation's fault flag, reports a
//! frame error, and returns normally. From then on every guarded callback of
//! that generation is a no-op, so output freezes on the last good frame.
//! Deferred parameters freeze with it and keep returning their last value.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::capability::{Capability, Peripheral, Reply};
use crate::config::{Limits, SandboxConfig};
use crate::error::{FaultKind, ScriptError, SourceMap};
use crate::evaluator::call_isolated;
use crate::protocol::{StatusBus, StatusReport};
use crate::value::Value;

struct GuardState {
    generation: u64,
    fault: Cell<bool>,
    retired: Cell<bool>,
    bus: Rc<StatusBus>,
    limits: Limits,
    frame_methods: Vec<String>,
    param_methods: Vec<String>,
    source_map: SourceMap,
}

/// Fault state of one generation, shared by all of its guarded callbacks
#[derive(Clone)]
pub struct DrawGuard {
    state: Rc<GuardState>,
}

impl DrawGuard {
    pub fn new(
        generation: u64,
        bus: Rc<StatusBus>,
        config: &SandboxConfig,
        source_map: SourceMap,
    ) -> Self {
        Self {
            state: Rc::new(GuardState {
                generation,
                fault: Cell::new(false),
                retired: Cell::new(false),
                bus,
                limits: config.limits,
                frame_methods: config.frame_methods.clone(),
                param_methods: config.param_methods.clone(),
                source_map,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn has_frame_fault(&self) -> bool {
        self.state.fault.get()
    }

    /// Stop every callback of this generation from running again
    pub fn retire(&self) {
        self.state.retired.set(true);
    }

    pub fn is_frame_method(&self, method: &str) -> bool {
        self.state.frame_methods.iter().any(|m| m == method)
    }

    fn is_param_method(&self, method: &str) -> bool {
        self.state.param_methods.iter().any(|m| m == method)
    }

    fn is_frozen(state: &GuardState) -> bool {
        state.fault.get() || state.retired.get()
    }

    pub fn wrap(&self, callback: Value) -> Value {
        let state = Rc::downgrade(&self.state);
        Value::native(move |args| {
            let Some(state) = state.upgrade() else {
                return Ok(Value::Nil);
            };
            if Self::is_frozen(&state) {
                return Ok(Value::Nil);
            }
            if let Err(e) = call_isolated(&callback, args.to_vec(), state.limits) {
                state.fault.set(true);
                log::warn!(
                    "frame callback of generation {} failed, freezing output: {}",
                    state.generation,
                    e
                );
                let report = ScriptError::from_eval(FaultKind::Frame, &e, &state.source_map);
                state.bus.emit(StatusReport::RunError(report));
            }
            Ok(Value::Nil)
        })
    }

    /// Wrap a deferred parameter. Its failures stay the peripheral's to report;
    /// once the generation is frozen it returns its last value without running.
    pub fn wrap_param(&self, callback: Value) -> Value {
        let state = Rc::downgrade(&self.state);
        let last: RefCell<Option<Value>> = RefCell::new(None);
        Value::native(move |args| {
            let Some(state) = state.upgrade().filter(|state| !Self::is_frozen(state)) else {
                return Ok(last.borrow().clone().unwrap_or(Value::Nil));
            };
            let value =
                call_isolated(&callback, args.to_vec(), state.limits).map_err(|e| e.message)?;
            *last.borrow_mut() = Some(value.clone());
            Ok(value)
        })
    }

    fn guard_args(&self, method: &str, args: Vec<Value>) -> Vec<Value> {
        let wrap: fn(&DrawGuard, Value) -> Value = if self.is_frame_method(method) {
            DrawGuard::wrap
        } else if self.is_param_method(method) {
            DrawGuard::wrap_param
        } else {
            return args;
        };
        args.into_iter()
            .map(|arg| if arg.is_callable() { wrap(self, arg) } else { arg })
            .collect()
    }

    fn guard_reply(&self, reply: Reply) -> Reply {
        match reply {
            Reply::Object(child) => Reply::Object(self.guard_object(child)),
            value => value,
        }
    }

    pub fn guard_peripheral(&self, peripheral: Rc<dyn Peripheral>) -> Rc<GuardedPeripheral> {
        Rc::new(GuardedPeripheral {
            inner: peripheral,
            guard: self.clone(),
        })
    }

    pub fn guard_object(&self, object: Rc<dyn Capability>) -> Rc<dyn Capability> {
        Rc::new(GuardedCapability {
            inner: object,
            guard: self.clone(),
        })
    }
}

/// Decorator over the peripheral; only frame-callback registration changes
pub struct GuardedPeripheral {
    inner: Rc<dyn Peripheral>,
    guard: DrawGuard,
}

impl Capability for GuardedPeripheral {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String> {
        let args = self.guard.guard_args(method, args);
        self.inner
            .call(method, args)
            .map(|reply| self.guard.guard_reply(reply))
    }

    fn clear_frame_callbacks(&self) {
        self.inner.clear_frame_callbacks()
    }
}

impl Peripheral for GuardedPeripheral {
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
        self.inner.is_rendering()
    }

    fn reset_clock(&self) {
        self.inner.reset_clock()
    }

    fn render_frame(&self, now: Duration) {
        self.inner.render_frame(now)
    }

    fn frame_count(&self) -> u64 {
        self.inner.frame_count()
    }

    fn elapsed(&self) -> Duration {
        self.inner.elapsed()
    }

    fn sub_objects(&self) -> Vec<Rc<dyn Capability>> {
        self.inner
            .sub_objects()
            .into_iter()
            .map(|object| self.guard.guard_object(object))
            .collect()
    }

    fn reset_sub_objects(&self) {
        self.inner.reset_sub_objects()
    }
}

/// Decorator over sub-objects such as layers
pub struct GuardedCapability {
    inner: Rc<dyn Capability>,
    guard: DrawGuard,
}

impl Capability for GuardedCapability {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String> {
        let args = self.guard.guard_args(method, args);
        self.inner
            .call(method, args)
            .map(|reply| self.guard.guard_reply(reply))
    }

    fn clear_frame_callbacks(&self) {
        self.inner.clear_frame_callbacks()
    }
}
