use thiserror::Error;

use crate::eval::EvalError;
use crate::tokenizer::token::Span;

/// Errors that can end up stored as an attribute's value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("{name}: cannot compile formula: {message}")]
    Compile {
        name: String,
        message: String,
        span: Option<Span>,
    },
    #[error("{name}: {source}")]
    Evaluation { name: String, source: EvalError },
    #[error("{name}: dependency {dependency} failed: {source}")]
    Dependency {
        name: String,
        dependency: String,
        source: Box<FormulaError>,
    },
    #[error("{rule}: rule target {target} is not declared")]
    UnknownRuleTarget { rule: String, target: String },
    #[error("{0} is not writable")]
    NotWritable(String),
}

impl FormulaError {
    /// The error that started a dependency chain.
    pub fn root_cause(&self) -> &FormulaError {
        match self {
            FormulaError::Dependency { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn evaluation(name: &str, source: EvalError) -> Self {
        // a failed dependency surfaces as a dependency error of this attribute
        match source {
            EvalError::Dependency { dependency, source } => FormulaError::Dependency {
                name: name.to_string(),
                dependency,
                source,
            },
            source => FormulaError::Evaluation {
                name: name.to_string(),
                source,
            },
        }
    }
}

pub type FormulaResult<T> = Result<T, FormulaError>;
