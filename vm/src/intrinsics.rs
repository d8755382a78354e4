//! Constrained standard library
//!
//! These are the only ambient facilities a revision can reach besides the
//! sandbox globals. All of them are pure apart from `random` and `print`.

use std::collections::HashMap;
use std::rc::Rc;

use rand::Rng;

use crate::value::{Environment, Keyword, NativeFn, Value};

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{} expects {} argument{}, got {}",
            name,
            expected,
            if expected == 1 { "" } else { "s" },
            args.len()
        ));
    }
    Ok(())
}

fn number(name: &str, value: &Value) -> Result<f64, String> {
    value
        .as_number()
        .ok_or_else(|| format!("{} expects numbers, got {}", name, value.type_name()))
}

/// Fold numbers, staying in integers until a float shows up
fn fold_numeric(
    name: &'static str,
    args: &[Value],
    init: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    let mut acc = Value::Int(init);
    for arg in args {
        acc = match (&acc, arg.strip_meta()) {
            (Value::Int(a), Value::Int(b)) => Value::Int(
                int_op(*a, *b).ok_or_else(|| format!("{}: integer overflow", name))?,
            ),
            (a, b) => Value::Float(float_op(number(name, a)?, number(name, b)?)),
        };
    }
    Ok(acc)
}

pub fn intrinsic_add() -> NativeFn {
    Rc::new(|args| fold_numeric("+", args, 0, i64::checked_add, |a, b| a + b))
}

pub fn intrinsic_mul() -> NativeFn {
    Rc::new(|args| fold_numeric("*", args, 1, i64::checked_mul, |a, b| a * b))
}

pub fn intrinsic_sub() -> NativeFn {
    Rc::new(|args| match args {
        [] => Err("- expects at least one argument".to_string()),
        [only] => fold_numeric("-", std::slice::from_ref(only), 0, i64::checked_sub, |a, b| a - b),
        [first, rest @ ..] => {
            let start = match first.strip_meta() {
                Value::Int(n) => *n,
                other => {
                    let mut acc = number("-", other)?;
                    for arg in rest {
                        acc -= number("-", arg)?;
                    }
                    return Ok(Value::Float(acc));
                }
            };
            fold_numeric("-", rest, start, i64::checked_sub, |a, b| a - b)
        }
    })
}

pub fn intrinsic_div() -> NativeFn {
    Rc::new(|args| {
        if args.is_empty() {
            return Err("/ expects at least one argument".to_string());
        }
        let (mut acc, rest) = if args.len() == 1 {
            (1.0, args)
        } else {
            (number("/", &args[0])?, &args[1..])
        };
        let all_ints = args.iter().all(|a| matches!(a.strip_meta(), Value::Int(_)));
        for arg in rest {
            let divisor = number("/", arg)?;
            if divisor == 0.0 {
                return Err("division by zero".to_string());
            }
            acc /= divisor;
        }
        // Exact integer quotients stay integers
        if all_ints && acc.fract() == 0.0 {
            Ok(Value::Int(acc as i64))
        } else {
            Ok(Value::Float(acc))
        }
    })
}

pub fn intrinsic_mod() -> NativeFn {
    Rc::new(|args| {
        arity("mod", args, 2)?;
        match (args[0].strip_meta(), args[1].strip_meta()) {
            (_, Value::Int(0)) => Err("division by zero".to_string()),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.rem_euclid(*b))),
            (a, b) => {
                let divisor = number("mod", b)?;
                if divisor == 0.0 {
                    return Err("division by zero".to_string());
                }
                Ok(Value::Float(number("mod", a)?.rem_euclid(divisor)))
            }
        }
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => a.strip_meta() == b.strip_meta(),
    }
}

fn comparison(name: &'static str, test: fn(f64, f64) -> bool) -> NativeFn {
    Rc::new(move |args| {
        if args.len() < 2 {
            return Err(format!("{} expects at least 2 arguments", name));
        }
        for pair in args.windows(2) {
            if !test(number(name, &pair[0])?, number(name, &pair[1])?) {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    })
}

fn items<'a>(name: &str, value: &'a Value) -> Result<&'a [Value], String> {
    match value.strip_meta() {
        Value::List(items) | Value::Vector(items) => Ok(items),
        Value::Nil => Ok(&[]),
        other => Err(format!("{} expects a list, got {}", name, other.type_name())),
    }
}

fn map_key(value: &Value) -> Result<String, String> {
    match value.strip_meta() {
        Value::Keyword(Keyword(k)) => Ok(k.clone()),
        Value::Str(s) => Ok(s.clone()),
        other => Err(format!("map keys must be keywords or strings, got {}", other.type_name())),
    }
}

fn display_plain(value: &Value) -> String {
    match value.strip_meta() {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn unary_math(name: &'static str, f: fn(f64) -> f64) -> NativeFn {
    Rc::new(move |args| {
        arity(name, args, 1)?;
        Ok(Value::Float(f(number(name, &args[0])?)))
    })
}

pub fn intrinsic_random() -> NativeFn {
    Rc::new(|args| {
        let mut rng = rand::thread_rng();
        match args {
            [] => Ok(Value::Float(rng.gen::<f64>())),
            [upper] => match upper.strip_meta() {
                Value::Int(n) if *n > 0 => Ok(Value::Int(rng.gen_range(0..*n))),
                Value::Int(_) => Err("random expects a positive bound".to_string()),
                other => Ok(Value::Float(rng.gen::<f64>() * number("random", other)?)),
            },
            _ => Err("random expects at most 1 argument".to_string()),
        }
    })
}

fn predicate(name: &'static str, test: fn(&Value) -> bool) -> NativeFn {
    Rc::new(move |args| {
        arity(name, args, 1)?;
        Ok(Value::Bool(test(args[0].strip_meta())))
    })
}

/// All standard library functions by name
pub fn register_stdlib() -> HashMap<String, NativeFn> {
    let mut lib: HashMap<String, NativeFn> = HashMap::new();

    // Arithmetic
    lib.insert("+".to_string(), intrinsic_add());
    lib.insert("-".to_string(), intrinsic_sub());
    lib.insert("*".to_string(), intrinsic_mul());
    lib.insert("/".to_string(), intrinsic_div());
    lib.insert("mod".to_string(), intrinsic_mod());

    // Comparison
    lib.insert(
        "=".to_string(),
        Rc::new(|args| {
            if args.len() < 2 {
                return Err("= expects at least 2 arguments".to_string());
            }
            Ok(Value::Bool(args[1..].iter().all(|a| values_equal(&args[0], a))))
        }),
    );
    lib.insert("<".to_string(), comparison("<", |a, b| a < b));
    lib.insert(">".to_string(), comparison(">", |a, b| a > b));
    lib.insert("<=".to_string(), comparison("<=", |a, b| a <= b));
    lib.insert(">=".to_string(), comparison(">=", |a, b| a >= b));
    lib.insert(
        "not".to_string(),
        Rc::new(|args| {
            arity("not", args, 1)?;
            Ok(Value::Bool(!args[0].is_truthy()))
        }),
    );

    // Lists, vectors and maps
    lib.insert("list".to_string(), Rc::new(|args| Ok(Value::List(args.to_vec()))));
    lib.insert("vector".to_string(), Rc::new(|args| Ok(Value::Vector(args.to_vec()))));
    lib.insert(
        "cons".to_string(),
        Rc::new(|args| {
            arity("cons", args, 2)?;
            let mut list = vec![args[0].clone()];
            list.extend_from_slice(items("cons", &args[1])?);
            Ok(Value::List(list))
        }),
    );
    let first: NativeFn = Rc::new(|args| {
        arity("first", args, 1)?;
        Ok(items("first", &args[0])?.first().cloned().unwrap_or(Value::Nil))
    });
    lib.insert("car".to_string(), first.clone());
    lib.insert("first".to_string(), first);
    let rest: NativeFn = Rc::new(|args| {
        arity("rest", args, 1)?;
        let list = items("rest", &args[0])?;
        Ok(Value::List(list.iter().skip(1).cloned().collect()))
    });
    lib.insert("cdr".to_string(), rest.clone());
    lib.insert("rest".to_string(), rest);
    lib.insert(
        "count".to_string(),
        Rc::new(|args| {
            arity("count", args, 1)?;
            let n = match args[0].strip_meta() {
                Value::Map(map) => map.len(),
                Value::Str(s) => s.chars().count(),
                other => items("count", other)?.len(),
            };
            Ok(Value::Int(n as i64))
        }),
    );
    lib.insert(
        "nth".to_string(),
        Rc::new(|args| {
            arity("nth", args, 2)?;
            let list = items("nth", &args[0])?;
            match args[1].strip_meta() {
                Value::Int(i) if *i >= 0 && (*i as usize) < list.len() => Ok(list[*i as usize].clone()),
                Value::Int(i) => Err(format!("index {} out of bounds for length {}", i, list.len())),
                other => Err(format!("nth expects an integer index, got {}", other.type_name())),
            }
        }),
    );
    lib.insert(
        "get".to_string(),
        Rc::new(|args| {
            if args.len() < 2 || args.len() > 3 {
                return Err("get expects 2 or 3 arguments".to_string());
            }
            let default = args.get(2).cloned().unwrap_or(Value::Nil);
            match args[0].strip_meta() {
                Value::Map(map) => Ok(map.get(&map_key(&args[1])?).cloned().unwrap_or(default)),
                Value::Nil => Ok(default),
                other => {
                    let list = items("get", other)?;
                    match args[1].strip_meta() {
                        Value::Int(i) if *i >= 0 => {
                            Ok(list.get(*i as usize).cloned().unwrap_or(default))
                        }
                        _ => Ok(default),
                    }
                }
            }
        }),
    );
    lib.insert(
        "assoc".to_string(),
        Rc::new(|args| {
            if args.len() < 3 || args.len() % 2 == 0 {
                return Err("assoc expects a map followed by key/value pairs".to_string());
            }
            let mut map = match args[0].strip_meta() {
                Value::Map(map) => map.clone(),
                Value::Nil => HashMap::new(),
                other => return Err(format!("assoc expects a map, got {}", other.type_name())),
            };
            for pair in args[1..].chunks(2) {
                map.insert(map_key(&pair[0])?, pair[1].clone());
            }
            Ok(Value::Map(map))
        }),
    );
    lib.insert(
        "str".to_string(),
        Rc::new(|args| Ok(Value::Str(args.iter().map(display_plain).collect()))),
    );

    // Math
    lib.insert("sin".to_string(), unary_math("sin", f64::sin));
    lib.insert("cos".to_string(), unary_math("cos", f64::cos));
    lib.insert("sqrt".to_string(), unary_math("sqrt", f64::sqrt));
    lib.insert(
        "floor".to_string(),
        Rc::new(|args| {
            arity("floor", args, 1)?;
            Ok(Value::Int(number("floor", &args[0])?.floor() as i64))
        }),
    );
    lib.insert(
        "abs".to_string(),
        Rc::new(|args| {
            arity("abs", args, 1)?;
            match args[0].strip_meta() {
                Value::Int(n) => n
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| "abs: integer overflow".to_string()),
                other => Ok(Value::Float(number("abs", other)?.abs())),
            }
        }),
    );
    lib.insert(
        "pow".to_string(),
        Rc::new(|args| {
            arity("pow", args, 2)?;
            Ok(Value::Float(number("pow", &args[0])?.powf(number("pow", &args[1])?)))
        }),
    );
    for (name, pick_max) in [("min", false), ("max", true)] {
        lib.insert(
            name.to_string(),
            Rc::new(move |args| {
                let mut best: Option<(f64, &Value)> = None;
                for arg in args {
                    let n = number(name, arg)?;
                    let better = match best {
                        None => true,
                        Some((b, _)) => (pick_max && n > b) || (!pick_max && n < b),
                    };
                    if better {
                        best = Some((n, arg));
                    }
                }
                best.map(|(_, v)| v.strip_meta().clone())
                    .ok_or_else(|| format!("{} expects at least one argument", name))
            }),
        );
    }
    lib.insert("random".to_string(), intrinsic_random());

    // Predicates
    lib.insert("nil?".to_string(), predicate("nil?", |v| matches!(v, Value::Nil)));
    lib.insert(
        "number?".to_string(),
        predicate("number?", |v| matches!(v, Value::Int(_) | Value::Float(_))),
    );
    lib.insert(
        "list?".to_string(),
        predicate("list?", |v| matches!(v, Value::List(_) | Value::Vector(_))),
    );
    lib.insert("fn?".to_string(), predicate("fn?", |v| v.is_callable()));
    lib.insert("string?".to_string(), predicate("string?", |v| matches!(v, Value::Str(_))));

    // Effects
    lib.insert(
        "print".to_string(),
        Rc::new(|args| {
            let line: Vec<String> = args.iter().map(display_plain).collect();
            log::info!(target: "script", "{}", line.join(" "));
            Ok(Value::Nil)
        }),
    );
    lib.insert(
        "error".to_string(),
        Rc::new(|args| {
            let message: Vec<String> = args.iter().map(display_plain).collect();
            if message.is_empty() {
                Err("error".to_string())
            } else {
                Err(message.join(" "))
            }
        }),
    );

    lib
}

/// Bind the standard library into an environment
pub fn install(env: &Environment) {
    for (name, f) in register_stdlib() {
        env.define(&name, Value::NativeFunction(f));
    }
    env.define("pi", Value::Float(std::f64::consts::PI));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        let lib = register_stdlib();
        let f = lib.get(name).unwrap();
        f(args)
    }

    #[test]
    fn test_arithmetic_promotes_to_float() {
        assert_eq!(call("+", &[Value::Int(1), Value::Int(2)]).unwrap(), Value::Int(3));
        assert_eq!(
            call("+", &[Value::Int(1), Value::Float(0.5)]).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(call("-", &[Value::Int(5)]).unwrap(), Value::Int(-5));
        assert_eq!(call("-", &[Value::Int(5), Value::Int(2)]).unwrap(), Value::Int(3));
        assert_eq!(call("/", &[Value::Int(6), Value::Int(3)]).unwrap(), Value::Int(2));
        assert_eq!(call("/", &[Value::Int(1), Value::Int(2)]).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            call("/", &[Value::Int(1), Value::Int(0)]).unwrap_err(),
            "division by zero"
        );
        assert!(call("mod", &[Value::Int(1), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let err = call("*", &[Value::Int(i64::MAX), Value::Int(2)]).unwrap_err();
        assert_eq!(err, "*: integer overflow");
    }

    #[test]
    fn test_numeric_equality() {
        assert_eq!(call("=", &[Value::Int(1), Value::Float(1.0)]).unwrap(), Value::Bool(true));
        assert_eq!(
            call("=", &[Value::Str("a".into()), Value::Str("a".into())]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call("<", &[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_collections() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(call("count", &[list.clone()]).unwrap(), Value::Int(2));
        assert_eq!(call("nth", &[list.clone(), Value::Int(1)]).unwrap(), Value::Int(2));
        assert!(call("nth", &[list, Value::Int(5)]).is_err());

        let map = call("assoc", &[Value::Nil, Value::keyword("hue"), Value::Float(0.5)]).unwrap();
        assert_eq!(call("get", &[map, Value::keyword("hue")]).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn test_str_and_error() {
        assert_eq!(
            call("str", &[Value::Str("n=".into()), Value::Int(3)]).unwrap(),
            Value::Str("n=3".into())
        );
        assert_eq!(
            call("error", &[Value::Str("boom".into())]).unwrap_err(),
            "boom"
        );
    }

    #[test]
    fn test_random_bounds() {
        for _ in 0..20 {
            match call("random", &[Value::Int(3)]).unwrap() {
                Value::Int(n) => assert!((0..3).contains(&n)),
                other => panic!("Expected int, got {:?}", other),
            }
        }
    }
}
