//! Tree-walking evaluator for the sandbox language
//!
//! Each top-level invocation gets a fresh `Evaluator` carrying its own step
//! budget and nesting limit, so a runaway revision turns into an ordinary
//! `EvalError` instead of exhausting the host stack.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::config::Limits;
use crate::error::{EvalError, Position, StackFrame};
use crate::value::{Closure, Environment, Keyword, Symbol, Value};

struct CallFrame {
    function: String,
    called_at: Option<Position>,
}

pub struct Evaluator {
    limits: Limits,
    depth: usize,
    steps: u64,
    position: Option<Position>,
    frames: Vec<CallFrame>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Evaluator {
            limits,
            depth: 0,
            steps: 0,
            position: None,
            frames: Vec::new(),
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Build an error located at the form currently being evaluated
    fn error(&self, message: impl Into<String>) -> EvalError {
        let mut stack = Vec::with_capacity(self.frames.len());
        let mut position = self.position;
        for frame in self.frames.iter().rev() {
            stack.push(StackFrame {
                function: frame.function.clone(),
                position,
            });
            position = frame.called_at;
        }
        EvalError {
            message: message.into(),
            position: self.position,
            stack,
        }
    }

    pub fn eval(&mut self, expr: &Value, env: &Environment) -> Result<Value, EvalError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(self.error(format!(
                "step budget of {} exhausted",
                self.limits.max_steps
            )));
        }
        if self.depth >= self.limits.max_depth {
            return Err(self.error("maximum recursion depth exceeded"));
        }

        let saved = self.position;
        if let Some(position) = expr.location() {
            self.position = Some(position);
        }
        self.depth += 1;
        let result = self.eval_form(expr.strip_meta(), env);
        self.depth -= 1;
        self.position = saved;
        result
    }

    /// Evaluate a sequence, returning the last value
    pub fn eval_body(&mut self, body: &[Value], env: &Environment) -> Result<Value, EvalError> {
        let mut result = Value::Nil;
        for expr in body {
            result = self.eval(expr, env)?;
        }
        Ok(result)
    }

    fn eval_form(&mut self, expr: &Value, env: &Environment) -> Result<Value, EvalError> {
        match expr {
            Value::Symbol(sym) => env
                .lookup(sym)
                .ok_or_else(|| self.error(format!("undefined variable: {}", sym.0))),

            Value::Quote(inner) => Ok(inner.strip_meta_deep()),

            Value::List(items) if !items.is_empty() => self.eval_list(items, env),

            Value::Vector(items) => {
                let mut evaluated = Vec::with_capacity(items.len());
                for item in items {
                    evaluated.push(self.eval(item, env)?);
                }
                Ok(Value::Vector(evaluated))
            }

            Value::Map(map) => {
                let mut result = HashMap::with_capacity(map.len());
                for (k, v) in map {
                    result.insert(k.clone(), self.eval(v, env)?);
                }
                Ok(Value::Map(result))
            }

            // Self-evaluating, including the empty list
            other => Ok(other.clone()),
        }
    }

    fn eval_list(&mut self, items: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if let Value::Symbol(sym) = items[0].strip_meta() {
            let args = &items[1..];
            match sym.0.as_str() {
                "quote" => return self.eval_quote(args),
                "if" => return self.eval_if(args, env),
                "when" => return self.eval_when(args, env),
                "cond" => return self.eval_cond(args, env),
                "lambda" | "fn" => return self.eval_lambda(args, env, None),
                "define" => return self.eval_define(args, env),
                "set!" => return self.eval_set(args, env),
                "let" => return self.eval_let(args, env),
                "begin" | "do" => return self.eval_body(args, env),
                "and" => return self.eval_and(args, env),
                "or" => return self.eval_or(args, env),
                "apply" => return self.eval_apply(args, env),
                _ => {}
            }
        }

        // Function application
        let func = self.eval(&items[0], env)?;
        let mut args = Vec::with_capacity(items.len() - 1);
        for arg in &items[1..] {
            args.push(self.eval(arg, env)?);
        }
        self.apply(&func, args)
    }

    /// Special form: quote
    fn eval_quote(&mut self, args: &[Value]) -> Result<Value, EvalError> {
        if args.len() != 1 {
            return Err(self.error("quote expects exactly 1 argument"));
        }
        Ok(args[0].strip_meta_deep())
    }

    /// Special form: if
    fn eval_if(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if args.len() < 2 || args.len() > 3 {
            return Err(self.error("if expects 2 or 3 arguments"));
        }

        let condition = self.eval(&args[0], env)?;

        if condition.is_truthy() {
            self.eval(&args[1], env)
        } else if args.len() == 3 {
            self.eval(&args[2], env)
        } else {
            Ok(Value::Nil)
        }
    }

    fn eval_when(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if args.is_empty() {
            return Err(self.error("when expects a condition"));
        }
        if self.eval(&args[0], env)?.is_truthy() {
            self.eval_body(&args[1..], env)
        } else {
            Ok(Value::Nil)
        }
    }

    fn eval_cond(&mut self, clauses: &[Value], env: &Environment) -> Result<Value, EvalError> {
        for clause in clauses {
            let saved = self.position;
            if let Some(position) = clause.location() {
                self.position = Some(position);
            }
            let parts = match clause.strip_meta() {
                Value::List(parts) | Value::Vector(parts) if !parts.is_empty() => parts,
                _ => return Err(self.error("cond clauses must be non-empty lists")),
            };
            self.position = saved;

            let is_else = matches!(parts[0].strip_meta(), Value::Symbol(Symbol(s)) if s == "else");
            if is_else || self.eval(&parts[0], env)?.is_truthy() {
                return self.eval_body(&parts[1..], env);
            }
        }
        Ok(Value::Nil)
    }

    /// Special form: lambda / fn
    fn eval_lambda(
        &mut self,
        args: &[Value],
        env: &Environment,
        name: Option<String>,
    ) -> Result<Value, EvalError> {
        if args.is_empty() {
            return Err(self.error("fn expects a parameter list"));
        }

        let params = match args[0].strip_meta() {
            Value::List(items) | Value::Vector(items) => {
                let mut params = Vec::with_capacity(items.len());
                for item in items {
                    match item.strip_meta() {
                        Value::Symbol(sym) => params.push(sym.clone()),
                        _ => return Err(self.error("fn parameters must be symbols")),
                    }
                }
                params
            }
            _ => return Err(self.error("fn expects a parameter list")),
        };

        Ok(Value::Closure(Rc::new(Closure {
            name,
            params,
            body: args[1..].to_vec(),
            env: env.clone(),
            origin: self.position,
        })))
    }

    /// Special form: define
    ///
    /// `(define name expr)` or `(define (name params...) body...)`
    fn eval_define(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if args.is_empty() {
            return Err(self.error("define expects a name"));
        }

        match args[0].strip_meta() {
            Value::Symbol(sym) => {
                if args.len() != 2 {
                    return Err(self.error("define expects exactly 2 arguments"));
                }
                let value = match lambda_form(&args[1]) {
                    Some(lambda_args) => {
                        let saved = self.position;
                        if let Some(position) = args[1].location() {
                            self.position = Some(position);
                        }
                        let closure = self.eval_lambda(lambda_args, env, Some(sym.0.clone()));
                        self.position = saved;
                        closure?
                    }
                    None => self.eval(&args[1], env)?,
                };
                env.define(&sym.0, value);
                Ok(Value::Nil)
            }
            Value::List(signature) if !signature.is_empty() => {
                let name = match signature[0].strip_meta() {
                    Value::Symbol(sym) => sym.0.clone(),
                    _ => return Err(self.error("define expects a symbol as function name")),
                };
                let mut lambda_args = Vec::with_capacity(args.len());
                lambda_args.push(Value::List(signature[1..].to_vec()));
                lambda_args.extend_from_slice(&args[1..]);
                let closure = self.eval_lambda(&lambda_args, env, Some(name.clone()))?;
                env.define(&name, closure);
                Ok(Value::Nil)
            }
            _ => Err(self.error("define expects a symbol as first argument")),
        }
    }

    /// Special form: set! (mutation of an existing binding)
    fn eval_set(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if args.len() != 2 {
            return Err(self.error("set! expects exactly 2 arguments"));
        }

        match args[0].strip_meta() {
            Value::Symbol(sym) => {
                let value = self.eval(&args[1], env)?;
                if env.set(sym, value) {
                    Ok(Value::Nil)
                } else {
                    Err(self.error(format!("cannot set! undefined variable: {}", sym.0)))
                }
            }
            _ => Err(self.error("set! expects a symbol as first argument")),
        }
    }

    /// Special form: let
    ///
    /// Accepts `((x 1) (y 2))` or `[x 1 y 2]`; bindings are sequential.
    fn eval_let(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if args.is_empty() {
            return Err(self.error("let expects a binding list"));
        }

        let let_env = Environment::with_parent(env);

        match args[0].strip_meta() {
            Value::List(bindings) => {
                for binding in bindings {
                    match binding.strip_meta() {
                        Value::List(pair) if pair.len() == 2 => {
                            self.bind_let(&pair[0], &pair[1], &let_env)?;
                        }
                        _ => return Err(self.error("let bindings must be pairs")),
                    }
                }
            }
            Value::Vector(flat) => {
                if flat.len() % 2 != 0 {
                    return Err(self.error("let bindings must be pairs"));
                }
                for pair in flat.chunks(2) {
                    self.bind_let(&pair[0], &pair[1], &let_env)?;
                }
            }
            _ => return Err(self.error("let expects a list of bindings")),
        }

        self.eval_body(&args[1..], &let_env)
    }

    fn bind_let(
        &mut self,
        name: &Value,
        expr: &Value,
        let_env: &Environment,
    ) -> Result<(), EvalError> {
        match name.strip_meta() {
            Value::Symbol(sym) => {
                let value = self.eval(expr, let_env)?;
                let_env.define(&sym.0, value);
                Ok(())
            }
            _ => Err(self.error("let binding must start with a symbol")),
        }
    }

    fn eval_and(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        let mut result = Value::Bool(true);
        for arg in args {
            result = self.eval(arg, env)?;
            if !result.is_truthy() {
                break;
            }
        }
        Ok(result)
    }

    fn eval_or(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        for arg in args {
            let value = self.eval(arg, env)?;
            if value.is_truthy() {
                return Ok(value);
            }
        }
        Ok(Value::Nil)
    }

    /// Special form: apply
    fn eval_apply(&mut self, args: &[Value], env: &Environment) -> Result<Value, EvalError> {
        if args.len() != 2 {
            return Err(self.error("apply expects exactly 2 arguments"));
        }

        let func = self.eval(&args[0], env)?;
        match self.eval(&args[1], env)? {
            Value::List(items) | Value::Vector(items) => self.apply(&func, items),
            Value::Nil => self.apply(&func, Vec::new()),
            _ => Err(self.error("apply expects a list as second argument")),
        }
    }

    /// Apply a function to already evaluated arguments
    pub fn apply(&mut self, func: &Value, args: Vec<Value>) -> Result<Value, EvalError> {
        match func.strip_meta() {
            Value::NativeFunction(f) => f(&args).map_err(|message| self.error(message)),
            Value::Closure(closure) => {
                if args.len() != closure.params.len() {
                    return Err(self.error(format!(
                        "{} expects {} arguments, got {}",
                        closure.name.as_deref().unwrap_or("function"),
                        closure.params.len(),
                        args.len()
                    )));
                }
                self.apply_closure(closure, args)
            }
            // (:key map) looks the key up
            Value::Keyword(Keyword(key)) => match args.first().map(|a| a.strip_meta()) {
                Some(Value::Map(map)) => Ok(map.get(key).cloned().unwrap_or(Value::Nil)),
                _ => Err(self.error(format!("keyword :{} expects a map", key))),
            },
            other => Err(self.error(format!("cannot call {}", other.type_name()))),
        }
    }

    fn apply_closure(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Value, EvalError> {
        let call_env = Environment::with_parent(&closure.env);
        for (param, arg) in closure.params.iter().zip(args) {
            call_env.define(&param.0, arg);
        }

        self.frames.push(CallFrame {
            function: closure
                .name
                .clone()
                .unwrap_or_else(|| "<anonymous>".to_string()),
            called_at: self.position,
        });
        let saved = self.position;
        self.position = closure.origin.or(saved);
        let result = self.eval_body(&closure.body, &call_env);
        self.position = saved;
        self.frames.pop();
        result
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn lambda_form(expr: &Value) -> Option<&[Value]> {
    match expr.strip_meta() {
        Value::List(items) if !items.is_empty() => match items[0].strip_meta() {
            Value::Symbol(Symbol(s)) if s == "fn" || s == "lambda" => Some(&items[1..]),
            _ => None,
        },
        _ => None,
    }
}

/// Invoke any callable value from host code.
///
/// Host-driven calls are lenient about arity: missing parameters are bound to
/// nil and surplus arguments are dropped, so `(fn () ...)` works as a frame
/// callback even though the host passes the frame number and time.
pub fn call_value(func: &Value, mut args: Vec<Value>, limits: Limits) -> Result<Value, EvalError> {
    if let Value::Closure(closure) = func.strip_meta() {
        args.resize(closure.params.len(), Value::Nil);
    }
    let mut evaluator = Evaluator::with_limits(limits);
    evaluator.apply(func, args)
}

/// `call_value` behind a panic boundary
pub fn call_isolated(func: &Value, args: Vec<Value>, limits: Limits) -> Result<Value, EvalError> {
    panic::catch_unwind(AssertUnwindSafe(|| call_value(func, args, limits)))
        .unwrap_or_else(|payload| Err(EvalError::new(panic_message(payload.as_ref()))))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic in native code".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics;
    use crate::parser::{parse, parse_one};

    fn global_env() -> Environment {
        let env = Environment::new();
        intrinsics::install(&env);
        env
    }

    fn run(source: &str) -> Result<Value, EvalError> {
        let env = global_env();
        let forms = parse(source).unwrap();
        Evaluator::new().eval_body(&forms, &env)
    }

    #[test]
    fn test_eval_self_evaluating() {
        let mut evaluator = Evaluator::new();
        let env = Environment::new();

        assert_eq!(evaluator.eval(&Value::Int(42), &env).unwrap(), Value::Int(42));
        assert_eq!(evaluator.eval(&Value::Bool(true), &env).unwrap(), Value::Bool(true));
        assert_eq!(evaluator.eval(&Value::Nil, &env).unwrap(), Value::Nil);
    }

    #[test]
    fn test_eval_if() {
        assert_eq!(run("(if #t 1 2)").unwrap(), Value::Int(1));
        assert_eq!(run("(if #f 1 2)").unwrap(), Value::Int(2));
        assert_eq!(run("(if nil 1)").unwrap(), Value::Nil);
    }

    #[test]
    fn test_eval_lambda() {
        assert_eq!(run("((lambda (x y) (+ x y)) 3 4)").unwrap(), Value::Int(7));
        assert_eq!(run("((fn [x] (* x x)) 5)").unwrap(), Value::Int(25));
    }

    #[test]
    fn test_eval_let() {
        assert_eq!(run("(let ((x 3) (y 4)) (+ x y))").unwrap(), Value::Int(7));
        assert_eq!(run("(let [x 3 y (+ x 1)] (* x y))").unwrap(), Value::Int(12));
    }

    #[test]
    fn test_define_returns_nil_and_binds() {
        assert_eq!(run("(define x 1)").unwrap(), Value::Nil);
        assert_eq!(run("(define x 1) (set! x (+ x 1)) x").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_set_unbound_fails() {
        let err = run("(set! nope 1)").unwrap_err();
        assert_eq!(err.message, "cannot set! undefined variable: nope");
    }

    #[test]
    fn test_cond_and_logic() {
        let source = "(define (sign n) (cond ((< n 0) -1) ((= n 0) 0) (else 1))) (list (sign -5) (sign 0) (sign 3))";
        assert_eq!(
            run(source).unwrap(),
            Value::List(vec![Value::Int(-1), Value::Int(0), Value::Int(1)])
        );
        assert_eq!(run("(and 1 2 3)").unwrap(), Value::Int(3));
        assert_eq!(run("(and 1 #f 3)").unwrap(), Value::Bool(false));
        assert_eq!(run("(or nil 2)").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_closures_share_state() {
        let source = r#"
            (define (make-counter)
              (let ((n 0))
                (fn () (set! n (+ n 1)) n)))
            (define c (make-counter))
            (c)
            (c)
        "#;
        assert_eq!(run(source).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_recursive_function() {
        let source = r#"
            (define fact
              (lambda (n)
                (if (< n 2)
                    1
                    (* n (fact (- n 1))))))
            (fact 5)
        "#;
        assert_eq!(run(source).unwrap(), Value::Int(120));
    }

    #[test]
    fn test_error_location_and_stack() {
        let source = "(define (boom)\n  (error \"bad\"))\n(boom)";
        let err = run(source).unwrap_err();
        assert_eq!(err.message, "bad");
        assert_eq!(err.position, Some(Position::new(2, 3)));
        assert_eq!(err.stack.len(), 1);
        assert_eq!(err.stack[0].function, "boom");
        assert_eq!(err.stack[0].position, Some(Position::new(2, 3)));
    }

    #[test]
    fn test_runaway_recursion_is_an_error() {
        let env = global_env();
        let limits = Limits {
            max_depth: 64,
            max_steps: 1_000_000,
        };
        let forms = parse("(define (down n) (+ 1 (down n))) (down 1)").unwrap();
        let err = Evaluator::with_limits(limits)
            .eval_body(&forms, &env)
            .unwrap_err();
        assert_eq!(err.message, "maximum recursion depth exceeded");
        assert!(err.stack.iter().all(|frame| frame.function == "down"));
    }

    #[test]
    fn test_step_budget() {
        let env = global_env();
        let limits = Limits {
            max_depth: 200,
            max_steps: 50,
        };
        let forms = parse("(define (f n) (if (< n 1) 0 (f (- n 1)))) (f 100)").unwrap();
        let err = Evaluator::with_limits(limits)
            .eval_body(&forms, &env)
            .unwrap_err();
        assert!(err.message.contains("step budget"));
    }

    #[test]
    fn test_call_value_pads_arguments() {
        let env = global_env();
        let f = Evaluator::new()
            .eval(&parse_one("(fn (a b) (list a b))").unwrap(), &env)
            .unwrap();
        let result = call_value(&f, vec![Value::Int(1)], Limits::default()).unwrap();
        assert_eq!(result, Value::List(vec![Value::Int(1), Value::Nil]));

        let g = Evaluator::new()
            .eval(&parse_one("(fn () 7)").unwrap(), &env)
            .unwrap();
        let result = call_value(&g, vec![Value::Int(1), Value::Float(0.5)], Limits::default());
        assert_eq!(result.unwrap(), Value::Int(7));
    }

    #[test]
    fn test_call_isolated_catches_panics() {
        let f = Value::native(|_| panic!("native blew up"));
        let err = call_isolated(&f, vec![], Limits::default()).unwrap_err();
        assert_eq!(err.message, "panic: native blew up");
    }
}
