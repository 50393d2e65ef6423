//! Sandboxed formula interpreter.
//!
//! [`expression::ExpressionEvaluator`] walks an [`crate::ast::Expression`] against an
//! [`context::Environment`]. Nothing outside the environment and the builtins in
//! [`builtins`] is reachable from a formula.

pub mod builtins;
pub mod context;
pub mod expression;
pub mod value;

use thiserror::Error;

use crate::engine::error::FormulaError;

pub use context::{Binding, Environment, Scope};
pub use expression::ExpressionEvaluator;
pub use value::{AttrQuality, DevState, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("name '{0}' is not defined")]
    UndefinedVariable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("unsupported operand types for {op}: {left} and {right}")]
    UnsupportedOperands {
        op: String,
        left: &'static str,
        right: &'static str,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("index error: {0}")]
    Index(String),
    #[error("{function}(): {message}")]
    Argument { function: String, message: String },
    #[error("external call failed: {0}")]
    External(String),
    #[error("dependency {dependency} failed: {source}")]
    Dependency {
        dependency: String,
        source: Box<FormulaError>,
    },
    #[error("sub-formula failed: {0}")]
    Formula(Box<FormulaError>),
    #[error("{0}")]
    Eval(String),
}

pub type EvalResult<T> = Result<T, EvalError>;
