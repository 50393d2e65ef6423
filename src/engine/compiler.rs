use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use super::error::{FormulaError, FormulaResult};
use super::names::NameKey;
use crate::analyzer::{parse_formula, ParseError};
use crate::ast::Expression;
use crate::tokenizer::token::{Span, Token, TokenSpan, TokenizerError};
use crate::tokenizer::tokenize_formula;

/// A formula compiled once.
///
/// Compilation never fails outright: a syntactically broken formula is kept as a
/// broken unit and reports its error each time it is executed.
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    source: String,
    identifiers: Vec<String>,
    expression: Result<Arc<Expression>, FormulaError>,
}

impl CompiledFormula {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Identifier tokens in source order, available even when parsing failed.
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn is_broken(&self) -> bool {
        self.expression.is_err()
    }

    pub fn expression(&self) -> FormulaResult<Arc<Expression>> {
        self.expression.clone()
    }

    pub fn references(&self, name: &str) -> bool {
        let key = NameKey::new(name);
        self.identifiers.iter().any(|id| key.matches(id))
    }
}

#[tracing::instrument(level = "debug", skip(source))]
pub fn compile(name: &str, source: &str) -> CompiledFormula {
    let spans = match tokenize_formula(source) {
        Ok(spans) => spans,
        Err(e) => {
            debug!("formula of {} does not tokenize: {}", name, e);
            return CompiledFormula {
                source: source.to_string(),
                identifiers: Vec::new(),
                expression: Err(tokenizer_error(name, e)),
            };
        }
    };

    let identifiers = spans
        .iter()
        .filter_map(|span| match &span.token {
            Token::Identifier(id) => Some(id.clone()),
            _ => None,
        })
        .collect();
    let tokens: Vec<Token> = spans.iter().map(|span| span.token.clone()).collect();

    let expression = parse_formula(&tokens)
        .map(Arc::new)
        .map_err(|e| parse_error(name, source, &spans, e));
    if let Err(e) = &expression {
        debug!("formula of {} is broken: {}", name, e);
    }

    CompiledFormula {
        source: source.to_string(),
        identifiers,
        expression,
    }
}

fn tokenizer_error(name: &str, error: TokenizerError) -> FormulaError {
    match error {
        TokenizerError::ParseError { found, span, .. } => FormulaError::Compile {
            name: name.to_string(),
            message: format!("invalid character at {}, found: {}", span, found),
            span: Some(span),
        },
    }
}

fn parse_error(name: &str, source: &str, spans: &[TokenSpan], error: ParseError) -> FormulaError {
    let (message, span) = match error.root() {
        ParseError::ParseError {
            message,
            found,
            position,
        } => {
            let span = spans.get(position.0).map(|t| Span {
                start: t.start,
                end: t.end,
                line: t.line,
                column: t.column,
            });
            (format!("{} '{}'", message, found), span)
        }
        ParseError::EOF | ParseError::UnexpectedEOF => (
            "unexpected end of formula".to_string(),
            Some(end_of_input(source, spans)),
        ),
        other => (format!("invalid syntax: {}", other), None),
    };
    FormulaError::Compile {
        name: name.to_string(),
        message,
        span,
    }
}

fn end_of_input(source: &str, spans: &[TokenSpan]) -> Span {
    match spans.last() {
        Some(last) => Span {
            start: last.end,
            end: last.end,
            line: last.line,
            column: last.column + (last.end - last.start),
        },
        None => Span {
            start: source.len(),
            end: source.len(),
            line: 1,
            column: 1,
        },
    }
}

/// Compiled formulas keyed by their text, for formulas that are not attributes.
///
/// Holds at most `capacity` entries; the oldest one is evicted first.
#[derive(Debug)]
pub struct FormulaCache {
    capacity: usize,
    units: HashMap<String, CompiledFormula>,
    order: VecDeque<String>,
}

impl FormulaCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            units: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get_or_compile(&mut self, source: &str) -> CompiledFormula {
        if let Some(unit) = self.units.get(source) {
            return unit.clone();
        }
        while self.units.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.units.remove(&oldest);
                }
                None => break,
            }
        }
        let unit = compile(source, source);
        self.units.insert(source.to_string(), unit.clone());
        self.order.push_back(source.to_string());
        unit
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for FormulaCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
