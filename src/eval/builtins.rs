//! Builtin functions available to every formula:
//! `int float str bool abs len sum avg max min round now`.

use super::context::Environment;
use super::value::Value;
use super::{EvalError, EvalResult};

/// Dispatches a builtin by (case-insensitive) name. Returns `None` for unknown names.
pub fn call_builtin(name: &str, args: &[Value], env: &dyn Environment) -> Option<EvalResult<Value>> {
    let name = name.to_lowercase();
    let result = match name.as_str() {
        "int" => unary(&name, args).and_then(to_int),
        "float" => unary(&name, args).and_then(to_float),
        "str" => unary(&name, args).map(|v| Value::String(v.to_string())),
        "bool" => unary(&name, args).map(|v| Value::Boolean(v.is_truthy())),
        "abs" => unary(&name, args).and_then(abs),
        "len" => unary(&name, args).and_then(len),
        "sum" => unary(&name, args).and_then(|v| sum(&name, v)),
        "avg" => unary(&name, args).and_then(|v| avg(&name, v)),
        "max" => extreme(&name, args, std::cmp::Ordering::Greater),
        "min" => extreme(&name, args, std::cmp::Ordering::Less),
        "round" => round(&name, args),
        "now" => {
            if args.is_empty() {
                Ok(Value::Float(env.now().as_secs_f64()))
            } else {
                Err(argument_error(&name, "takes no arguments"))
            }
        }
        _ => return None,
    };
    Some(result)
}

fn argument_error(function: &str, message: &str) -> EvalError {
    EvalError::Argument {
        function: function.to_string(),
        message: message.to_string(),
    }
}

fn unary<'a>(function: &str, args: &'a [Value]) -> EvalResult<&'a Value> {
    match args {
        [value] => Ok(value),
        _ => Err(argument_error(
            function,
            &format!("takes exactly one argument ({} given)", args.len()),
        )),
    }
}

fn to_int(value: &Value) -> EvalResult<Value> {
    match value.inner() {
        Value::Float(f) if f.is_finite() => Ok(Value::Integer(f.trunc() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| argument_error("int", &format!("invalid literal '{}'", s))),
        other => other
            .as_integer()
            .map(Value::Integer)
            .ok_or_else(|| argument_error("int", &format!("cannot convert {}", other.type_name()))),
    }
}

fn to_float(value: &Value) -> EvalResult<Value> {
    value
        .to_f64()
        .map(Value::Float)
        .ok_or_else(|| argument_error("float", &format!("cannot convert '{}'", value)))
}

fn abs(value: &Value) -> EvalResult<Value> {
    match value.inner() {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => other
            .as_integer()
            .map(|i| Value::Integer(i.saturating_abs()))
            .ok_or_else(|| argument_error("abs", &format!("bad operand {}", other.type_name()))),
    }
}

fn len(value: &Value) -> EvalResult<Value> {
    match value.inner() {
        Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Integer(items.len() as i64)),
        other => Err(argument_error(
            "len",
            &format!("object of type '{}' has no len()", other.type_name()),
        )),
    }
}

fn numbers<'a>(function: &str, value: &'a Value) -> EvalResult<&'a [Value]> {
    match value.inner() {
        Value::List(items) => {
            if let Some(bad) = items.iter().find(|v| v.as_number().is_none()) {
                return Err(argument_error(
                    function,
                    &format!("requires a list of numbers, but got {}", bad.type_name()),
                ));
            }
            Ok(items)
        }
        other => Err(argument_error(
            function,
            &format!("requires a list, but got {}", other.type_name()),
        )),
    }
}

fn sum(function: &str, value: &Value) -> EvalResult<Value> {
    let items = numbers(function, value)?;
    let all_integers = items.iter().all(|v| v.as_integer().is_some());
    if all_integers {
        let mut total = 0i64;
        for item in items {
            match item.as_integer().and_then(|i| total.checked_add(i)) {
                Some(t) => total = t,
                None => {
                    return Ok(Value::Float(
                        items.iter().filter_map(Value::as_number).sum::<f64>(),
                    ))
                }
            }
        }
        Ok(Value::Integer(total))
    } else {
        Ok(Value::Float(items.iter().filter_map(Value::as_number).sum()))
    }
}

fn avg(function: &str, value: &Value) -> EvalResult<Value> {
    let items = numbers(function, value)?;
    if items.is_empty() {
        return Err(argument_error(function, "empty list"));
    }
    let total: f64 = items.iter().filter_map(Value::as_number).sum();
    Ok(Value::Float(total / items.len() as f64))
}

// max/min accept either one list argument or several scalar arguments
fn extreme(function: &str, args: &[Value], wanted: std::cmp::Ordering) -> EvalResult<Value> {
    let candidates: &[Value] = match args {
        [single] => match single.inner() {
            Value::List(items) => items.as_slice(),
            _ => args,
        },
        _ => args,
    };
    let mut best: Option<&Value> = None;
    for candidate in candidates {
        best = match best {
            None => Some(candidate),
            Some(current) => match candidate.loose_cmp(current) {
                Some(ordering) if ordering == wanted => Some(candidate),
                Some(_) => Some(current),
                None => {
                    return Err(argument_error(
                        function,
                        &format!(
                            "cannot compare {} and {}",
                            candidate.type_name(),
                            current.type_name()
                        ),
                    ))
                }
            },
        };
    }
    best.cloned()
        .ok_or_else(|| argument_error(function, "arg is an empty sequence"))
}

// round(x) -> int with ties to even, round(x, n) -> float
fn round(function: &str, args: &[Value]) -> EvalResult<Value> {
    let (value, digits) = match args {
        [value] => (value, None),
        [value, digits] => (value, Some(digits)),
        _ => return Err(argument_error(function, "takes one or two arguments")),
    };
    let x = value
        .as_number()
        .ok_or_else(|| argument_error(function, &format!("bad operand {}", value.type_name())))?;
    match digits {
        None => Ok(Value::Integer(x.round_ties_even() as i64)),
        Some(digits) => {
            let n = digits
                .as_integer()
                .ok_or_else(|| argument_error(function, "ndigits must be an integer"))?;
            if let Some(i) = value.as_integer() {
                return Ok(Value::Integer(i));
            }
            let factor = 10f64.powi(n as i32);
            Ok(Value::Float((x * factor).round_ties_even() / factor))
        }
    }
}
