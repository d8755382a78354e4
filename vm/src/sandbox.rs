//! Tracked scheduling primitives exposed to user code
//!
//! Every timer, interval, frame callback and listener a revision creates goes
//! through these wrappers and lands in its generation's `ResourceArena`. The
//! wrappers only hold a weak reference to the arena: once that generation is
//! torn down they refuse to register anything new. Cancelling only releases
//! handles the generation itself owns.

use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::arena::{ResourceArena, Subscription};
use crate::capability::{arg_callable, arg_number, arg_string};
use crate::config::Limits;
use crate::draw_guard::DrawGuard;
use crate::error::{FaultKind, ScriptError, SourceMap};
use crate::evaluator::call_isolated;
use crate::event_loop::{Callback, EventLoop, FrameId, ListenerId, ListenerOptions, TimerId};
use crate::protocol::{StatusBus, StatusReport};
use crate::value::Value;

/// Generation-scoped context shared by the tracked wrappers
#[derive(Clone)]
pub struct SandboxScope {
    arena: Weak<ResourceArena>,
    generation: u64,
    host: Rc<EventLoop>,
    bus: Rc<StatusBus>,
    limits: Limits,
    source_map: Rc<SourceMap>,
}

impl SandboxScope {
    pub fn new(
        arena: &Rc<ResourceArena>,
        host: Rc<EventLoop>,
        bus: Rc<StatusBus>,
        limits: Limits,
        source_map: SourceMap,
    ) -> Self {
        Self {
            arena: Rc::downgrade(arena),
            generation: arena.generation(),
            host,
            bus,
            limits,
            source_map: Rc::new(source_map),
        }
    }

    fn live_arena(&self) -> Result<Rc<ResourceArena>, String> {
        match self.arena.upgrade() {
            Some(arena) if !arena.is_disposed() => Ok(arena),
            _ => Err(format!("generation {} has been torn down", self.generation)),
        }
    }

    /// Run a timer or listener callback, reporting failures as async faults
    fn run_async(&self, callback: &Value, args: Vec<Value>) {
        if let Err(e) = call_isolated(callback, args, self.limits) {
            log::warn!("async callback of generation {} failed: {}", self.generation, e);
            let report = ScriptError::from_eval(FaultKind::Async, &e, &self.source_map);
            self.bus.emit(StatusReport::RunError(report));
        }
    }

    fn set_timeout(&self, args: &[Value]) -> Result<Value, String> {
        let callback = arg_callable("set-timeout", args, 0)?;
        let delay = delay_arg("set-timeout", args)?;
        let arena = self.live_arena()?;

        let slot: Rc<Cell<Option<TimerId>>> = Rc::new(Cell::new(None));
        let fired = slot.clone();
        let scope = self.clone();
        let wrapped: Callback = Rc::new(move |_| {
            if let (Some(id), Some(arena)) = (fired.get(), scope.arena.upgrade()) {
                arena.untrack_timeout(id);
            }
            scope.run_async(&callback, Vec::new());
            Ok(Value::Nil)
        });

        let id = arena.track_timeout(self.host.set_timeout(wrapped, delay));
        slot.set(Some(id));
        Ok(Value::Int(id.0 as i64))
    }

    fn clear_timeout(&self, args: &[Value]) -> Result<Value, String> {
        if let Some(id) = handle_arg(args) {
            let id = TimerId(id);
            let owned = self.arena.upgrade().map_or(false, |arena| arena.untrack_timeout(id));
            if owned {
                self.host.clear_timeout(id);
            }
        }
        Ok(Value::Nil)
    }

    fn set_interval(&self, args: &[Value]) -> Result<Value, String> {
        let callback = arg_callable("set-interval", args, 0)?;
        let period = delay_arg("set-interval", args)?;
        let arena = self.live_arena()?;

        let scope = self.clone();
        let wrapped: Callback = Rc::new(move |_| {
            scope.run_async(&callback, Vec::new());
            Ok(Value::Nil)
        });

        let id = arena.track_interval(self.host.set_interval(wrapped, period));
        Ok(Value::Int(id.0 as i64))
    }

    fn clear_interval(&self, args: &[Value]) -> Result<Value, String> {
        if let Some(id) = handle_arg(args) {
            let id = TimerId(id);
            let owned = self.arena.upgrade().map_or(false, |arena| arena.untrack_interval(id));
            if owned {
                self.host.clear_interval(id);
            }
        }
        Ok(Value::Nil)
    }

    fn request_frame(&self, guard: &DrawGuard, args: &[Value]) -> Result<Value, String> {
        let guarded = guard.wrap(arg_callable("request-frame", args, 0)?);
        let arena = self.live_arena()?;

        let slot: Rc<Cell<Option<FrameId>>> = Rc::new(Cell::new(None));
        let fired = slot.clone();
        let weak = self.arena.clone();
        let wrapped: Callback = Rc::new(move |frame_args| {
            if let (Some(id), Some(arena)) = (fired.get(), weak.upgrade()) {
                arena.untrack_frame(id);
            }
            match &guarded {
                Value::NativeFunction(f) => f(frame_args),
                _ => Ok(Value::Nil),
            }
        });

        let id = arena.track_frame(self.host.request_frame(wrapped));
        slot.set(Some(id));
        Ok(Value::Int(id.0 as i64))
    }

    fn cancel_frame(&self, args: &[Value]) -> Result<Value, String> {
        if let Some(id) = handle_arg(args) {
            let id = FrameId(id);
            let owned = self.arena.upgrade().map_or(false, |arena| arena.untrack_frame(id));
            if owned {
                self.host.cancel_frame(id);
            }
        }
        Ok(Value::Nil)
    }

    /// `(add-listener target type handler {:once true})`
    fn add_listener(&self, args: &[Value]) -> Result<Value, String> {
        let target = arg_string("add-listener", args, 0)?;
        let event = arg_string("add-listener", args, 1)?;
        let handler = arg_callable("add-listener", args, 2)?;
        let options = match args.get(3).map(|v| v.strip_meta()) {
            Some(Value::Map(map)) => ListenerOptions {
                once: map.get("once").map(|v| v.is_truthy()).unwrap_or(false),
            },
            Some(Value::Nil) | None => ListenerOptions::default(),
            Some(other) => {
                return Err(format!(
                    "add-listener expects an options map, got {}",
                    other.type_name()
                ))
            }
        };
        let arena = self.live_arena()?;

        let slot: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));
        let fired = slot.clone();
        let scope = self.clone();
        let callback = handler.clone();
        let wrapped: Callback = Rc::new(move |payload| {
            if options.once {
                if let (Some(id), Some(arena)) = (fired.get(), scope.arena.upgrade()) {
                    arena.untrack_listener(id);
                }
            }
            scope.run_async(&callback, payload.to_vec());
            Ok(Value::Nil)
        });

        let id = self.host.add_listener(&target, &event, wrapped, options);
        slot.set(Some(id));
        arena.track_listener(Subscription {
            id,
            target,
            event,
            handler,
            options,
        });
        Ok(Value::Int(id.0 as i64))
    }

    fn remove_listener(&self, args: &[Value]) -> Result<Value, String> {
        if let Some(id) = handle_arg(args) {
            let id = ListenerId(id);
            let owned = self
                .arena
                .upgrade()
                .map_or(false, |arena| arena.untrack_listener(id).is_some());
            if owned {
                self.host.remove_listener(id);
            }
        }
        Ok(Value::Nil)
    }

    fn on_dispose(&self, args: &[Value]) -> Result<Value, String> {
        let teardown = arg_callable("on-dispose", args, 0)?;
        let arena = self.live_arena()?;
        let limits = self.limits;
        arena.on_dispose(move || {
            call_isolated(&teardown, Vec::new(), limits)
                .map(|_| ())
                .map_err(|e| e.message)
        });
        Ok(Value::Nil)
    }

    /// The tracked scheduling globals, by name
    pub fn globals(&self, guard: &DrawGuard) -> Vec<(String, Value)> {
        type Handler = fn(&SandboxScope, &[Value]) -> Result<Value, String>;
        let plain: [(&str, Handler); 8] = [
            ("set-timeout", SandboxScope::set_timeout),
            ("clear-timeout", SandboxScope::clear_timeout),
            ("set-interval", SandboxScope::set_interval),
            ("clear-interval", SandboxScope::clear_interval),
            ("cancel-frame", SandboxScope::cancel_frame),
            ("add-listener", SandboxScope::add_listener),
            ("remove-listener", SandboxScope::remove_listener),
            ("on-dispose", SandboxScope::on_dispose),
        ];

        let mut globals: Vec<(String, Value)> = plain
            .into_iter()
            .map(|(name, handler)| {
                let scope = self.clone();
                (name.to_string(), Value::native(move |args| handler(&scope, args)))
            })
            .collect();

        let scope = self.clone();
        let guard = guard.clone();
        globals.push((
            "request-frame".to_string(),
            Value::native(move |args| scope.request_frame(&guard, args)),
        ));
        globals
    }
}

fn delay_arg(name: &str, args: &[Value]) -> Result<Duration, String> {
    if args.len() < 2 {
        return Ok(Duration::ZERO);
    }
    let ms = arg_number(name, args, 1)?;
    if !ms.is_finite() {
        return Err(format!("{} expects a finite delay", name));
    }
    Ok(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
}

fn handle_arg(args: &[Value]) -> Option<u64> {
    match args.first().map(|v| v.strip_meta()) {
        Some(Value::Int(id)) if *id > 0 => Some(*id as u64),
        _ => None,
    }
}
