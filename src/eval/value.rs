use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::timestamp::Timestamp;

/// Device state vocabulary. The integer codes are fixed and exposed to formulas
/// through `int(STATE)`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum DevState {
    On = 0,
    Off = 1,
    Close = 2,
    Open = 3,
    Insert = 4,
    Extract = 5,
    Moving = 6,
    Standby = 7,
    Fault = 8,
    Init = 9,
    Running = 10,
    Alarm = 11,
    Disable = 12,
    #[default]
    Unknown = 13,
}

impl DevState {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        DevState::iter().find(|s| s.code() == code)
    }
}

/// Quality tag attached to every stored value.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum AttrQuality {
    #[default]
    #[strum(to_string = "ATTR_VALID", serialize = "VALID")]
    Valid = 0,
    #[strum(to_string = "ATTR_INVALID", serialize = "INVALID")]
    Invalid = 1,
    #[strum(to_string = "ATTR_ALARM", serialize = "ALARM")]
    Alarm = 2,
    #[strum(to_string = "ATTR_CHANGING", serialize = "CHANGING")]
    Changing = 3,
    #[strum(to_string = "ATTR_WARNING", serialize = "WARNING")]
    Warning = 4,
}

impl AttrQuality {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        AttrQuality::iter().find(|q| q.code() == code)
    }

    /// Name without the `ATTR_` prefix, as bound inside quality rules.
    pub fn short_name(self) -> &'static str {
        match self {
            AttrQuality::Valid => "VALID",
            AttrQuality::Invalid => "INVALID",
            AttrQuality::Alarm => "ALARM",
            AttrQuality::Changing => "CHANGING",
            AttrQuality::Warning => "WARNING",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    State(DevState),
    Quality(AttrQuality),
    // a value that brings its own quality and time, e.g. an external read
    Reading {
        value: Box<Value>,
        quality: AttrQuality,
        timestamp: Option<Timestamp>,
    },
}

impl Value {
    pub fn reading(value: Value, quality: AttrQuality, timestamp: Option<Timestamp>) -> Self {
        Value::Reading {
            value: Box::new(value.into_inner()),
            quality,
            timestamp,
        }
    }

    /// Strips a [`Value::Reading`] wrapper.
    pub fn into_inner(self) -> Value {
        match self {
            Value::Reading { value, .. } => value.into_inner(),
            other => other,
        }
    }

    pub fn inner(&self) -> &Value {
        match self {
            Value::Reading { value, .. } => value.inner(),
            other => other,
        }
    }

    pub fn carried_quality(&self) -> Option<AttrQuality> {
        match self {
            Value::Reading { quality, .. } => Some(*quality),
            _ => None,
        }
    }

    pub fn carried_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Reading { timestamp, .. } => *timestamp,
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "None",
            Value::Boolean(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::State(_) => "DevState",
            Value::Quality(_) => "AttrQuality",
            Value::Reading { value, .. } => value.type_name(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self.inner() {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::State(s) => s.code() != 0,
            Value::Quality(q) => q.code() != 0,
            Value::Reading { value, .. } => value.is_truthy(),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.inner(), Value::List(_))
    }

    /// Numeric view used by arithmetic. Strings are not numbers here.
    pub fn as_number(&self) -> Option<f64> {
        match self.inner() {
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::State(s) => Some(s.code() as f64),
            Value::Quality(q) => Some(q.code() as f64),
            _ => None,
        }
    }

    /// Integer view for values that are exactly integral (bool, int, state, quality).
    pub fn as_integer(&self) -> Option<i64> {
        match self.inner() {
            Value::Boolean(b) => Some(*b as i64),
            Value::Integer(i) => Some(*i),
            Value::State(s) => Some(s.code()),
            Value::Quality(q) => Some(q.code()),
            _ => None,
        }
    }

    /// Numeric coercion that also accepts numeric strings.
    pub fn to_f64(&self) -> Option<f64> {
        match self.inner() {
            Value::String(s) => s.trim().parse::<f64>().ok(),
            other => other.as_number(),
        }
    }

    /// Python-style equality: numbers compare by value across int/float/bool/state.
    pub fn loose_eq(&self, other: &Value) -> bool {
        let (left, right) = (self.inner(), other.inner());
        match (left, right) {
            (Value::List(l), Value::List(r)) => {
                l.len() == r.len() && l.iter().zip(r).all(|(a, b)| a.loose_eq(b))
            }
            (Value::String(l), Value::String(r)) => l == r,
            (Value::Null, Value::Null) => true,
            _ => match (left.as_number(), right.as_number()) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            },
        }
    }

    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        let (left, right) = (self.inner(), other.inner());
        match (left, right) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            (Value::List(l), Value::List(r)) => {
                for (a, b) in l.iter().zip(r) {
                    match a.loose_cmp(b)? {
                        Ordering::Equal => continue,
                        ordering => return Some(ordering),
                    }
                }
                Some(l.len().cmp(&r.len()))
            }
            _ => left.as_number()?.partial_cmp(&right.as_number()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Boolean(true) => write!(f, "True"),
            Value::Boolean(false) => write!(f, "False"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match item {
                        Value::String(s) => write!(f, "'{}'", s)?,
                        other => write!(f, "{}", other)?,
                    }
                }
                write!(f, "]")
            }
            Value::State(s) => write!(f, "{}", s),
            Value::Quality(q) => write!(f, "{}", q),
            Value::Reading { value, .. } => write!(f, "{}", value),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
