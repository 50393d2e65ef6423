use std::collections::HashMap;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::compiler::{compile, CompiledFormula};
use super::error::{FormulaError, FormulaResult};
use super::names::NameKey;
use crate::eval::{AttrQuality, Value};

/// `PATTERN=FORMULA` quality rule.
///
/// The pattern is anchored and case-insensitive. A trailing `*` or `.*` captures the
/// rest of the attribute name, and every `$` in the formula is replaced by that capture.
#[derive(Debug, Clone)]
pub struct QualityRule {
    pattern: String,
    regex: Regex,
    formula: String,
}

impl QualityRule {
    pub fn new(pattern: &str, formula: &str) -> FormulaResult<Self> {
        let pattern = pattern.trim();
        let body = if let Some(prefix) = pattern.strip_suffix(".*") {
            format!("{}(.*)", prefix)
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            format!("{}(.*)", prefix)
        } else {
            pattern.to_string()
        };
        let regex = RegexBuilder::new(&format!("^(?:{})$", body))
            .case_insensitive(true)
            .build()
            .map_err(|e| FormulaError::Compile {
                name: pattern.to_string(),
                message: format!("invalid quality pattern: {}", e),
                span: None,
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            formula: formula.trim().to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn formula(&self) -> &str {
        &self.formula
    }

    /// The formula to run for `name`, or `None` when the pattern does not match.
    pub fn formula_for(&self, name: &str) -> Option<String> {
        let captures = self.regex.captures(name)?;
        match captures.get(1) {
            Some(capture) => Some(self.formula.replace('$', capture.as_str())),
            None => Some(self.formula.clone()),
        }
    }
}

/// Ordered quality rules; the first matching pattern wins.
#[derive(Debug, Default)]
pub struct QualityDeriver {
    rules: Vec<QualityRule>,
    compiled: HashMap<NameKey, Option<CompiledFormula>>,
}

impl QualityDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: QualityRule) {
        self.rules.push(rule);
        self.compiled.clear();
    }

    pub fn set_rules(&mut self, rules: Vec<QualityRule>) {
        self.rules = rules;
        self.compiled.clear();
    }

    pub fn rules(&self) -> &[QualityRule] {
        &self.rules
    }

    /// Compiled quality formula for an attribute, cached per attribute name.
    pub fn rule_for(&mut self, name: &NameKey) -> Option<CompiledFormula> {
        if let Some(cached) = self.compiled.get(name) {
            return cached.clone();
        }
        let unit = self.rules.iter().find_map(|rule| {
            rule.formula_for(name.as_str()).map(|formula| {
                debug!("quality of {} follows rule {}", name, rule.pattern());
                compile(rule.pattern(), &formula)
            })
        });
        self.compiled.insert(name.clone(), unit.clone());
        unit
    }
}

/// Interprets a quality formula result: a quality constant, its integer code, or its
/// name.
pub fn quality_from_value(value: &Value) -> Option<AttrQuality> {
    match value.inner() {
        Value::Quality(q) => Some(*q),
        Value::String(s) => AttrQuality::from_str(s.trim()).ok(),
        other => other.as_integer().and_then(AttrQuality::from_code),
    }
}

/// Quality used when no rule applies.
pub fn default_quality(result: &Value) -> AttrQuality {
    result.carried_quality().unwrap_or(AttrQuality::Valid)
}
