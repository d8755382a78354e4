//! Evaluation of one code revision against a closed set of globals
//!
//! A revision is compiled as the body of `(fn (<globals>) ...)` on top of the
//! constrained standard library, then invoked with the generation's global
//! values. Nothing else is in scope.

use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::ResourceArena;
use crate::capability::{object_value, CapabilityTable, Peripheral};
use crate::config::Limits;
use crate::draw_guard::DrawGuard;
use crate::error::{FaultKind, ScriptError, SourceMap};
use crate::evaluator::{call_isolated, Evaluator};
use crate::event_loop::EventLoop;
use crate::intrinsics;
use crate::parser::parse;
use crate::protocol::StatusBus;
use crate::sandbox::SandboxScope;
use crate::value::{Environment, Value};

/// Names of the tracked scheduling globals
pub const SCHEDULING_GLOBALS: [&str; 9] = [
    "set-timeout",
    "clear-timeout",
    "set-interval",
    "clear-interval",
    "cancel-frame",
    "add-listener",
    "remove-listener",
    "on-dispose",
    "request-frame",
];

pub const PERIPHERAL_GLOBAL: &str = "canvas";

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxCheck {
    pub valid: bool,
    pub error: Option<ScriptError>,
}

pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<ScriptError>,
    pub dispose_callback: Option<Value>,
}

/// Everything one generation exposes to user code
pub struct SandboxBindings {
    pub arena: Rc<ResourceArena>,
    pub guard: DrawGuard,
    pub host: Rc<EventLoop>,
    pub peripheral: Rc<dyn Peripheral>,
    pub data_sources: CapabilityTable,
    pub bus: Rc<StatusBus>,
    pub limits: Limits,
    pub source_map: SourceMap,
}

impl SandboxBindings {
    /// The closed global namespace, in parameter order
    pub fn globals(&self) -> Vec<(String, Value)> {
        let mut globals = vec![(
            PERIPHERAL_GLOBAL.to_string(),
            object_value(self.guard.guard_peripheral(self.peripheral.clone())),
        )];
        let scope = SandboxScope::new(
            &self.arena,
            self.host.clone(),
            self.bus.clone(),
            self.limits,
            self.source_map.clone(),
        );
        globals.extend(scope.globals(&self.guard));
        globals.extend(self.data_sources.accessors());
        globals
    }
}

pub struct ExecutionContext {
    limits: Limits,
    param_names: Vec<String>,
    dispose_callback: RefCell<Option<Value>>,
}

impl ExecutionContext {
    pub fn new(limits: Limits, data_sources: &CapabilityTable) -> Self {
        let mut param_names = vec![PERIPHERAL_GLOBAL.to_string()];
        param_names.extend(SCHEDULING_GLOBALS.iter().map(|name| name.to_string()));
        param_names.extend(data_sources.list());
        Self {
            limits,
            param_names,
            dispose_callback: RefCell::new(None),
        }
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn has_dispose_callback(&self) -> bool {
        self.dispose_callback.borrow().is_some()
    }

    /// Parse-only check; builds the callable without invoking it
    pub fn validate_syntax(&self, code: &str) -> SyntaxCheck {
        match self.compile(code, &self.param_names) {
            Ok(_) => SyntaxCheck {
                valid: true,
                error: None,
            },
            Err(error) => SyntaxCheck {
                valid: false,
                error: Some(error),
            },
        }
    }

    fn compile(&self, code: &str, params: &[String]) -> Result<Value, ScriptError> {
        let map = SourceMap::new(code);
        let wrapped = format!("(fn ({})\n{}\n)", params.join(" "), code);
        let forms = parse(&wrapped).map_err(|e| ScriptError::from_parse(&e, &map))?;

        if forms.len() != 1 {
            let mut error = ScriptError::new(FaultKind::Syntax, "unbalanced ')'");
            if let Some(position) = forms.get(1).and_then(|form| form.location()) {
                let position = map.to_user(position);
                error.line = Some(position.line);
                error.column = Some(position.column);
            }
            return Err(error);
        }

        let env = Environment::new();
        intrinsics::install(&env);
        Evaluator::with_limits(self.limits)
            .eval(&forms[0], &env)
            .map_err(|e| ScriptError::from_eval(FaultKind::Syntax, &e, &map))
    }

    /// Call and forget the dispose callback retained from the previous run
    pub fn run_dispose_callback(&self) {
        let callback = self.dispose_callback.borrow_mut().take();
        if let Some(callback) = callback {
            if let Err(e) = call_isolated(&callback, Vec::new(), self.limits) {
                log::warn!("dispose callback failed: {}", e);
            }
        }
    }

    pub fn execute(&self, code: &str, bindings: &SandboxBindings) -> ExecutionResult {
        self.run_dispose_callback();

        let globals = bindings.globals();
        let (names, args): (Vec<String>, Vec<Value>) = globals.into_iter().unzip();
        let map = SourceMap::new(code);

        let program = match self.compile(code, &names) {
            Ok(program) => program,
            Err(error) => return failure(error),
        };

        match call_isolated(&program, args, self.limits) {
            Ok(value) => {
                let dispose_callback = match value.strip_meta() {
                    Value::Closure(_) => Some(value.clone()),
                    _ => None,
                };
                *self.dispose_callback.borrow_mut() = dispose_callback.clone();
                ExecutionResult {
                    success: true,
                    error: None,
                    dispose_callback,
                }
            }
            Err(e) => failure(ScriptError::from_eval(FaultKind::Init, &e, &map)),
        }
    }
}

fn failure(error: ScriptError) -> ExecutionResult {
    ExecutionResult {
        success: false,
        error: Some(error),
        dispose_callback: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::headless::HeadlessPeripheral;
    use std::cell::Cell;

    struct Fixture {
        context: ExecutionContext,
        bindings: SandboxBindings,
        canvas: Rc<HeadlessPeripheral>,
    }

    fn fixture(code: &str) -> Fixture {
        let host = Rc::new(EventLoop::new());
        let bus = Rc::new(StatusBus::new());
        let canvas = Rc::new(HeadlessPeripheral::new(64, 64, bus.clone()));
        let config = SandboxConfig::default();
        let data_sources = CapabilityTable::new();
        let bindings = SandboxBindings {
            arena: Rc::new(ResourceArena::new(1, host.clone())),
            guard: DrawGuard::new(1, bus.clone(), &config, SourceMap::new(code)),
            host,
            peripheral: canvas.clone(),
            data_sources: data_sources.clone(),
            bus,
            limits: config.limits,
            source_map: SourceMap::new(code),
        };
        Fixture {
            context: ExecutionContext::new(config.limits, &data_sources),
            bindings,
            canvas,
        }
    }

    #[test]
    fn test_validate_reports_user_coordinates() {
        let fx = fixture("");
        assert!(fx.context.validate_syntax("(define x 1)").valid);

        let check = fx.context.validate_syntax("(define x 1)\n(define y (");
        assert!(!check.valid);
        let error = check.error.unwrap();
        assert_eq!(error.kind, FaultKind::Syntax);
        assert_eq!(error.message, "unexpected end of input");
        assert_eq!(error.line, Some(2));

        let check = fx.context.validate_syntax("(+ 1 2))\n(print 1)");
        assert_eq!(check.error.unwrap().message, "unexpected ')'");

        // Closing the wrapper early and reopening it
        let check = fx.context.validate_syntax("1) (");
        assert_eq!(check.error.unwrap().message, "unbalanced ')'");
    }

    #[test]
    fn test_validate_has_no_side_effects() {
        let fx = fixture("");
        assert!(fx.context.validate_syntax("(canvas :draw (fn () nil))").valid);
        assert_eq!(fx.canvas.callback_count(), 0);
    }

    #[test]
    fn test_execute_registers_through_globals() {
        let code = "(define n 0)\n(canvas :draw (fn (frame t) (set! n frame)))\n(set-timeout (fn () nil) 100)";
        let fx = fixture(code);
        let result = fx.context.execute(code, &fx.bindings);
        assert!(result.success);
        assert!(result.dispose_callback.is_none());
        assert_eq!(fx.canvas.callback_count(), 1);
        assert_eq!(fx.bindings.arena.len(), 1);
    }

    #[test]
    fn test_no_ambient_scope() {
        let code = "(supervisor :dispose)";
        let fx = fixture(code);
        let result = fx.context.execute(code, &fx.bindings);
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, FaultKind::Init);
        assert_eq!(error.message, "undefined variable: supervisor");
        assert_eq!((error.line, error.column), (Some(1), Some(1)));
    }

    #[test]
    fn test_dispose_callback_runs_before_next_execute() {
        let code = "(fn () (error \"cleanup failed\"))";
        let fx = fixture(code);
        let result = fx.context.execute(code, &fx.bindings);
        assert!(result.success);
        assert!(result.dispose_callback.is_some());
        assert!(fx.context.has_dispose_callback());

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        *fx.context.dispose_callback.borrow_mut() = Some(Value::native(move |_| {
            flag.set(true);
            Err("ignored".to_string())
        }));
        let result = fx.context.execute("(define y 2)", &fx.bindings);
        assert!(result.success);
        assert!(ran.get());
        assert!(!fx.context.has_dispose_callback());
    }

    #[test]
    fn test_failed_execute_retains_nothing() {
        let code = "(define f (fn () nil))\n(error \"init failed\")\nf";
        let fx = fixture(code);
        let result = fx.context.execute(code, &fx.bindings);
        assert!(!result.success);
        assert!(result.dispose_callback.is_none());
        assert!(!fx.context.has_dispose_callback());
        let error = result.error.unwrap();
        assert_eq!(error.message, "init failed");
        assert_eq!(error.line, Some(2));
    }
}
