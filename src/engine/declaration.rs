//! Line-oriented declaration text.
//!
//! ```text
//! # comment
//! Temperature = DevDouble(RAW * 0.1)
//! Limit = 30
//! ```
//!
//! Every non-blank line is `NAME=FORMULA`, split at the first `=`, so formulas are free
//! to contain `==`. Attribute formulas may be wrapped in a type tag that forces the
//! result type.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::{EvalError, EvalResult, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeclarationError {
    #[error("line {line}: expected NAME=FORMULA, found: {text}")]
    MissingSeparator { line: usize, text: String },
    #[error("line {line}: empty name")]
    EmptyName { line: usize },
    #[error("line {line}: empty formula for {name}")]
    EmptyFormula { line: usize, name: String },
}

pub type DeclarationResult<T> = Result<T, DeclarationError>;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum TypeTag {
    DevDouble,
    DevLong,
    DevString,
    DevBoolean,
    DevVarDoubleArray,
    DevVarLongArray,
    DevVarStringArray,
    DevVarBooleanArray,
}

impl TypeTag {
    pub fn is_array(self) -> bool {
        matches!(
            self,
            TypeTag::DevVarDoubleArray
                | TypeTag::DevVarLongArray
                | TypeTag::DevVarStringArray
                | TypeTag::DevVarBooleanArray
        )
    }

    fn element(self) -> TypeTag {
        match self {
            TypeTag::DevVarDoubleArray => TypeTag::DevDouble,
            TypeTag::DevVarLongArray => TypeTag::DevLong,
            TypeTag::DevVarStringArray => TypeTag::DevString,
            TypeTag::DevVarBooleanArray => TypeTag::DevBoolean,
            scalar => scalar,
        }
    }

    /// Converts a formula result to this type. A carried quality and timestamp survive
    /// the conversion.
    pub fn coerce(self, value: Value) -> EvalResult<Value> {
        match value {
            Value::Reading {
                value,
                quality,
                timestamp,
            } => Ok(Value::reading(self.coerce(*value)?, quality, timestamp)),
            value if self.is_array() => {
                let items = match value {
                    Value::List(items) => items,
                    scalar => vec![scalar],
                };
                let element = self.element();
                items
                    .into_iter()
                    .map(|item| element.coerce(item))
                    .collect::<EvalResult<Vec<_>>>()
                    .map(Value::List)
            }
            value => self.coerce_scalar(value),
        }
    }

    fn coerce_scalar(self, value: Value) -> EvalResult<Value> {
        let cannot = |value: &Value| {
            EvalError::Type(format!("cannot convert {} '{}' to {}", value.type_name(), value, self))
        };
        match self {
            TypeTag::DevDouble => value.to_f64().map(Value::Float).ok_or_else(|| cannot(&value)),
            TypeTag::DevLong => match &value {
                Value::Float(f) if f.is_finite() => Ok(Value::Integer(f.trunc() as i64)),
                Value::String(s) => match s.trim().parse::<i64>() {
                    Ok(i) => Ok(Value::Integer(i)),
                    Err(_) => Err(cannot(&value)),
                },
                other => other.as_integer().map(Value::Integer).ok_or_else(|| cannot(&value)),
            },
            TypeTag::DevString => Ok(Value::String(value.to_string())),
            TypeTag::DevBoolean => Ok(Value::Boolean(value.is_truthy())),
            array => Err(EvalError::Type(format!("{} is not a scalar type", array))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDeclaration {
    pub name: String,
    pub formula: String,
    pub type_tag: Option<TypeTag>,
}

/// `NAME=FORMULA` line of a state or quality section. For quality rules the name is a
/// pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDeclaration {
    pub name: String,
    pub formula: String,
}

lazy_static! {
    static ref TYPE_TAG: Regex = Regex::new(
        r"(?i)^\s*(DevDouble|DevLong|DevString|DevBoolean|DevVarDoubleArray|DevVarLongArray|DevVarStringArray|DevVarBooleanArray)\s*\((.*)\)\s*$"
    )
    .expect("type tag pattern is valid");
}

pub fn parse_attributes(text: &str) -> DeclarationResult<Vec<AttributeDeclaration>> {
    parse_rules(text)?
        .into_iter()
        .map(|rule| {
            let (type_tag, formula) = split_type_tag(&rule.formula);
            Ok(AttributeDeclaration {
                name: rule.name,
                formula: formula.to_string(),
                type_tag,
            })
        })
        .collect()
}

pub fn parse_rules(text: &str) -> DeclarationResult<Vec<RuleDeclaration>> {
    let mut rules = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = strip_comment(raw).trim();
        if content.is_empty() {
            continue;
        }
        let (name, formula) = content
            .split_once('=')
            .ok_or_else(|| DeclarationError::MissingSeparator {
                line,
                text: content.to_string(),
            })?;
        let (name, formula) = (name.trim(), formula.trim());
        if name.is_empty() {
            return Err(DeclarationError::EmptyName { line });
        }
        if formula.is_empty() {
            return Err(DeclarationError::EmptyFormula {
                line,
                name: name.to_string(),
            });
        }
        rules.push(RuleDeclaration {
            name: name.to_string(),
            formula: formula.to_string(),
        });
    }
    Ok(rules)
}

/// Status formulas, one per line, in order.
pub fn parse_status(text: &str) -> Vec<String> {
    text.lines()
        .map(|raw| strip_comment(raw).trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Strips a leading type tag, provided its parentheses enclose the whole formula.
pub fn split_type_tag(formula: &str) -> (Option<TypeTag>, &str) {
    let Some(captures) = TYPE_TAG.captures(formula) else {
        return (None, formula.trim());
    };
    let (Some(tag), Some(inner)) = (captures.get(1), captures.get(2)) else {
        return (None, formula.trim());
    };
    match tag.as_str().parse::<TypeTag>() {
        Ok(tag) if is_balanced(inner.as_str()) => (Some(tag), inner.as_str().trim()),
        _ => (None, formula.trim()),
    }
}

fn is_balanced(text: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

// `#` inside a string literal is not a comment
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}
