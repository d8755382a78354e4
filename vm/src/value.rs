//! Value model for the embedded scripting language
//!
//! Everything a revision manipulates is a `Value`, including its own code.
//! Lists produced by the parser carry their source location as metadata so
//! the evaluator can attribute errors to a line and column.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::Position;

/// Symbol type for identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

/// Keyword type (like Clojure's keywords)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keyword(pub String);

/// User-defined function
pub struct Closure {
    pub name: Option<String>,
    pub params: Vec<Symbol>,
    pub body: Vec<Value>,
    pub env: Environment,
    /// Where the defining form starts
    pub origin: Option<Position>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Native function type
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

struct Frame {
    bindings: RefCell<HashMap<Symbol, Value>>,
    parent: Option<Environment>,
}

/// Lexically scoped, shared, mutable bindings
///
/// Cloning an environment yields another handle onto the same frame, which is
/// what closures capture.
#[derive(Clone)]
pub struct Environment {
    frame: Rc<Frame>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            frame: Rc::new(Frame {
                bindings: RefCell::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    pub fn with_parent(parent: &Environment) -> Self {
        Environment {
            frame: Rc::new(Frame {
                bindings: RefCell::new(HashMap::new()),
                parent: Some(parent.clone()),
            }),
        }
    }

    /// Bind in this frame, shadowing any outer binding
    pub fn define(&self, name: &str, value: Value) {
        self.frame
            .bindings
            .borrow_mut()
            .insert(Symbol(name.to_string()), value);
    }

    /// Rebind the nearest existing binding; false when unbound
    pub fn set(&self, symbol: &Symbol, value: Value) -> bool {
        let mut env = Some(self);
        while let Some(current) = env {
            let mut bindings = current.frame.bindings.borrow_mut();
            if let Some(slot) = bindings.get_mut(symbol) {
                *slot = value;
                return true;
            }
            drop(bindings);
            env = current.frame.parent.as_ref();
        }
        false
    }

    pub fn lookup(&self, symbol: &Symbol) -> Option<Value> {
        let mut env = Some(self);
        while let Some(current) = env {
            if let Some(value) = current.frame.bindings.borrow().get(symbol) {
                return Some(value.clone());
            }
            env = current.frame.parent.as_ref();
        }
        None
    }

    /// Names bound directly in this frame
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .frame
            .bindings
            .borrow()
            .keys()
            .map(|s| s.0.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.frame, &other.frame)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment({} bindings)", self.frame.bindings.borrow().len())
    }
}

/// Core value type
#[derive(Clone)]
pub enum Value {
    // Primitives
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(Symbol),
    Keyword(Keyword),

    // Collections
    List(Vec<Value>),
    Vector(Vec<Value>),
    Map(HashMap<String, Value>), // Use String keys to avoid recursion

    Quote(Box<Value>),

    // Functions
    Closure(Rc<Closure>),
    NativeFunction(NativeFn),

    // Metadata-carrying value
    WithMeta {
        value: Box<Value>,
        metadata: HashMap<String, Value>,
    },
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Quote(a), Value::Quote(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => Rc::ptr_eq(a, b),
            (
                Value::WithMeta { value: a, metadata: ma },
                Value::WithMeta { value: b, metadata: mb },
            ) => a == b && ma == mb,
            _ => false,
        }
    }
}

// Manual Debug since NativeFn doesn't implement Debug
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({:?})", b),
            Value::Int(i) => write!(f, "Int({:?})", i),
            Value::Float(fl) => write!(f, "Float({:?})", fl),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Symbol(s) => write!(f, "Symbol({:?})", s),
            Value::Keyword(k) => write!(f, "Keyword({:?})", k),
            Value::List(l) => write!(f, "List({:?})", l),
            Value::Vector(v) => write!(f, "Vector({:?})", v),
            Value::Map(m) => write!(f, "Map({:?})", m),
            Value::Quote(q) => write!(f, "Quote({:?})", q),
            Value::Closure(c) => write!(f, "{:?}", c),
            Value::NativeFunction(_) => write!(f, "NativeFunction(#<native>)"),
            Value::WithMeta { value, .. } => write!(f, "WithMeta({:?})", value),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Symbol(Symbol(s)) => write!(f, "{}", s),
            Value::Keyword(Keyword(k)) => write!(f, ":{}", k),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Vector(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, ":{} {}", k, m[*k])?;
                }
                write!(f, "}}")
            }
            Value::Quote(v) => write!(f, "'{}", v),
            Value::Closure(c) => match &c.name {
                Some(name) => write!(f, "#<fn {}>", name),
                None => write!(f, "#<fn>"),
            },
            Value::NativeFunction(_) => write!(f, "#<native>"),
            Value::WithMeta { value, .. } => write!(f, "{}", value),
        }
    }
}

impl Value {
    /// Everything except nil and false
    pub fn is_truthy(&self) -> bool {
        !matches!(self.strip_meta(), Value::Nil | Value::Bool(false))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self.strip_meta(),
            Value::Closure(_) | Value::NativeFunction(_)
        )
    }

    pub fn symbol(s: &str) -> Self {
        Value::Symbol(Symbol(s.to_string()))
    }

    pub fn keyword(k: &str) -> Self {
        Value::Keyword(Keyword(k.to_string()))
    }

    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + 'static,
    {
        Value::NativeFunction(Rc::new(f))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "keyword",
            Value::List(_) => "list",
            Value::Vector(_) => "vector",
            Value::Map(_) => "map",
            Value::Quote(_) => "quote",
            Value::Closure(_) | Value::NativeFunction(_) => "function",
            Value::WithMeta { value, .. } => value.type_name(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.strip_meta() {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Attach a source location to a value
    pub fn located(value: Value, position: Position) -> Value {
        let mut metadata = HashMap::new();
        metadata.insert("line".to_string(), Value::Int(position.line as i64));
        metadata.insert("column".to_string(), Value::Int(position.column as i64));
        Value::WithMeta {
            value: Box::new(value),
            metadata,
        }
    }

    pub fn location(&self) -> Option<Position> {
        match self {
            Value::WithMeta { metadata, .. } => {
                match (metadata.get("line"), metadata.get("column")) {
                    (Some(Value::Int(line)), Some(Value::Int(column))) => {
                        Some(Position::new(*line as usize, *column as usize))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn strip_meta(&self) -> &Value {
        match self {
            Value::WithMeta { value, .. } => value.strip_meta(),
            other => other,
        }
    }

    /// Remove metadata from this value and everything it contains
    pub fn strip_meta_deep(&self) -> Value {
        match self.strip_meta() {
            Value::List(items) => Value::List(items.iter().map(|v| v.strip_meta_deep()).collect()),
            Value::Vector(items) => {
                Value::Vector(items.iter().map(|v| v.strip_meta_deep()).collect())
            }
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.strip_meta_deep()))
                    .collect(),
            ),
            Value::Quote(inner) => Value::Quote(Box::new(inner.strip_meta_deep())),
            other => other.clone(),
        }
    }
}
