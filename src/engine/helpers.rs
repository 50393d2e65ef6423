use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use super::names::NameKey;
use crate::eval::{EvalError, EvalResult, Value};
use crate::timestamp::Timestamp;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("{0} is not reachable")]
    Unreachable(String),
    #[error("{name}: {message}")]
    Failed { name: String, message: String },
}

/// The device the engine reads external attributes from and sends commands to.
#[mockall::automock]
pub trait DeviceProxy: Send + Sync {
    fn read_attribute(&self, name: &str) -> Result<Value, ProxyError>;
    fn write_attribute(&self, name: &str, value: Value) -> Result<(), ProxyError>;
    fn command(&self, name: &str, argument: Value) -> Result<Value, ProxyError>;
}

/// Suppresses repeated device calls under a key that failed recently.
#[derive(Debug, Default)]
pub struct RetryThrottle {
    failures: DashMap<NameKey, Timestamp>,
}

impl RetryThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_throttled(&self, name: &str, now: Timestamp, period: Duration) -> bool {
        self.failures
            .get(&NameKey::new(name))
            .is_some_and(|failed| now.since(failed.value()) < period)
    }

    pub fn record_failure(&self, name: &str, now: Timestamp) {
        self.failures.insert(NameKey::new(name), now);
    }

    pub fn record_success(&self, name: &str) {
        self.failures.remove(&NameKey::new(name));
    }
}

/// Helper functions reachable from formulas, on top of the builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Helper {
    Attr,
    Xattr,
    Wattr,
    Command,
    Force,
    Var,
    Subeval,
}

pub(crate) fn arity(helper: Helper, args: &[Value], min: usize, max: usize) -> EvalResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(EvalError::Argument {
            function: helper.to_string(),
            message: format!("takes {} arguments ({} given)", expected, args.len()),
        });
    }
    Ok(())
}

pub(crate) fn name_argument(helper: Helper, args: &[Value]) -> EvalResult<String> {
    match args.first().map(Value::inner) {
        Some(Value::String(name)) => Ok(name.clone()),
        Some(other) => Err(EvalError::Argument {
            function: helper.to_string(),
            message: format!("name must be a string, not {}", other.type_name()),
        }),
        None => Err(EvalError::Argument {
            function: helper.to_string(),
            message: "missing name".to_string(),
        }),
    }
}

pub(crate) fn external(error: ProxyError) -> EvalError {
    EvalError::External(error.to_string())
}
