//! Capabilities injected into the sandbox
//!
//! The peripheral (rendering/audio engine) and any read-only data sources are
//! the only host objects user code can reach. In the language a capability
//! object is a message-passing function: `(canvas :draw f)`.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use crate::value::{Keyword, Value};

/// Result of a capability call
pub enum Reply {
    Value(Value),
    /// A sub-object such as a layer, itself callable by message
    Object(Rc<dyn Capability>),
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

pub trait Capability {
    fn name(&self) -> &str;

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String>;

    /// Drop every per-frame callback registered on this object
    fn clear_frame_callbacks(&self) {}
}

/// The external engine driven by the host loop
pub trait Peripheral: Capability {
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    /// True only while `render_frame` is running
    fn is_rendering(&self) -> bool;
    /// Zero the frame counter and elapsed clock
    fn reset_clock(&self);
    fn render_frame(&self, now: Duration);
    fn frame_count(&self) -> u64;
    fn elapsed(&self) -> Duration;
    /// Objects created through this peripheral that hold their own callbacks
    fn sub_objects(&self) -> Vec<Rc<dyn Capability>>;
    /// Forget sub-objects created by user code
    fn reset_sub_objects(&self) {}
}

/// Read-only injected accessor, exposed as a zero-argument global
pub trait DataSource {
    fn name(&self) -> &str;
    fn sample(&self) -> Result<Value, String>;
}

/// Registered data sources, keyed by global name
#[derive(Default, Clone)]
pub struct CapabilityTable {
    sources: BTreeMap<String, Rc<dyn DataSource>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Rc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn DataSource>> {
        self.sources.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn sample(&self, name: &str) -> Result<Value, String> {
        self.get(name)
            .ok_or_else(|| format!("data source '{}' not found", name))?
            .sample()
    }

    /// One zero-argument accessor per source
    pub fn accessors(&self) -> Vec<(String, Value)> {
        self.sources
            .iter()
            .map(|(name, source)| {
                let source = source.clone();
                (name.clone(), Value::native(move |_| source.sample()))
            })
            .collect()
    }
}

pub fn method_name(value: &Value) -> Result<String, String> {
    match value.strip_meta() {
        Value::Keyword(Keyword(k)) => Ok(k.clone()),
        Value::Str(s) => Ok(s.clone()),
        Value::Symbol(s) => Ok(s.0.clone()),
        other => Err(format!("expected a method name, got {}", other.type_name())),
    }
}

/// Wrap a capability as a message-passing function value
pub fn object_value(object: Rc<dyn Capability>) -> Value {
    Value::native(move |args| {
        let (method, rest) = match args.split_first() {
            Some((method, rest)) => (method_name(method)?, rest.to_vec()),
            None => return Err(format!("{} expects a method name", object.name())),
        };
        match object.call(&method, rest)? {
            Reply::Value(value) => Ok(value),
            Reply::Object(child) => Ok(object_value(child)),
        }
    })
}

pub fn arg_number(method: &str, args: &[Value], index: usize) -> Result<f64, String> {
    args.get(index)
        .and_then(|v| v.as_number())
        .ok_or_else(|| format!("{} expects a number as argument {}", method, index + 1))
}

pub fn arg_string(method: &str, args: &[Value], index: usize) -> Result<String, String> {
    match args.get(index).map(|v| v.strip_meta()) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(Value::Keyword(Keyword(k))) => Ok(k.clone()),
        _ => Err(format!("{} expects a string as argument {}", method, index + 1)),
    }
}

pub fn arg_callable(method: &str, args: &[Value], index: usize) -> Result<Value, String> {
    match args.get(index) {
        Some(v) if v.is_callable() => Ok(v.clone()),
        _ => Err(format!("{} expects a function as argument {}", method, index + 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counter {
        hits: Cell<i64>,
    }

    impl Capability for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, String> {
            match method {
                "bump" => {
                    let by = arg_number(method, &args, 0)? as i64;
                    self.hits.set(self.hits.get() + by);
                    Ok(Value::Int(self.hits.get()).into())
                }
                "child" => Ok(Reply::Object(Rc::new(Counter { hits: Cell::new(100) }))),
                _ => Err(format!("unknown method '{}' for counter", method)),
            }
        }
    }

    struct Constant;

    impl DataSource for Constant {
        fn name(&self) -> &str {
            "answer"
        }

        fn sample(&self) -> Result<Value, String> {
            Ok(Value::Int(42))
        }
    }

    #[test]
    fn test_object_value_dispatches_messages() {
        let object = object_value(Rc::new(Counter { hits: Cell::new(0) }));
        let Value::NativeFunction(f) = &object else {
            panic!("Expected native function");
        };
        assert_eq!(f(&[Value::keyword("bump"), Value::Int(2)]).unwrap(), Value::Int(2));
        assert_eq!(f(&[Value::keyword("bump"), Value::Int(3)]).unwrap(), Value::Int(5));
        assert!(f(&[Value::keyword("missing")]).is_err());
        assert!(f(&[]).is_err());

        let child = f(&[Value::keyword("child")]).unwrap();
        let Value::NativeFunction(g) = &child else {
            panic!("Expected sub-object");
        };
        assert_eq!(g(&[Value::keyword("bump"), Value::Int(1)]).unwrap(), Value::Int(101));
    }

    #[test]
    fn test_capability_table() {
        let mut table = CapabilityTable::new();
        table.register(Rc::new(Constant));
        assert!(table.has("answer"));
        assert!(!table.has("nonexistent"));
        assert_eq!(table.sample("answer").unwrap(), Value::Int(42));
        assert!(table.sample("nonexistent").is_err());

        let accessors = table.accessors();
        assert_eq!(accessors.len(), 1);
        let Value::NativeFunction(f) = &accessors[0].1 else {
            panic!("Expected accessor");
        };
        assert_eq!(f(&[]).unwrap(), Value::Int(42));
    }
}
