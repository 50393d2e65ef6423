use std::collections::HashSet;
use std::str::FromStr;

use tracing::{debug, warn};

use super::compiler::{compile, CompiledFormula};
use super::error::{FormulaError, FormulaResult};
use super::names::NameKey;
use crate::eval::{DevState, Value};

/// Name of the rule whose formula yields a state code directly.
pub const COMPOSITE_STATE: &str = "STATE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    State(DevState),
    /// `STATE=formula`: matches any state not covered by an explicit rule when
    /// `int(state) == int(formula)`.
    Composite,
    /// Not in the state vocabulary. Never matches.
    Unknown(String),
}

impl RuleTarget {
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if NameKey::new(name).matches(COMPOSITE_STATE) {
            return RuleTarget::Composite;
        }
        match DevState::from_str(name) {
            Ok(state) => RuleTarget::State(state),
            Err(_) => RuleTarget::Unknown(name.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateRule {
    pub name: String,
    pub target: RuleTarget,
    pub formula: CompiledFormula,
}

impl StateRule {
    pub fn new(name: &str, formula: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            target: RuleTarget::parse(name),
            formula: compile(name, formula.trim()),
        }
    }
}

/// Priority-ordered state rules plus the current state.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    rules: Vec<StateRule>,
    current: DevState,
}

impl StateMachine {
    pub fn new(initial: DevState) -> Self {
        Self {
            rules: Vec::new(),
            current: initial,
        }
    }

    pub fn current(&self) -> DevState {
        self.current
    }

    pub fn rules(&self) -> &[StateRule] {
        &self.rules
    }

    pub fn add_rule(&mut self, rule: StateRule) {
        self.rules.push(rule);
    }

    pub fn set_rules(&mut self, rules: Vec<StateRule>) {
        self.rules = rules;
    }

    /// Sets the state and returns the previous one if it differed.
    pub fn set_state(&mut self, state: DevState) -> Option<DevState> {
        let previous = std::mem::replace(&mut self.current, state);
        (previous != state).then_some(previous)
    }

    /// Runs the rules in declaration order and returns the state of the first one that
    /// holds. Failing predicates are logged and count as false.
    pub fn select<F>(&self, mut evaluate: F) -> Option<DevState>
    where
        F: FnMut(&StateRule) -> FormulaResult<Value>,
    {
        let listed: HashSet<DevState> = self
            .rules
            .iter()
            .filter_map(|rule| match rule.target {
                RuleTarget::State(state) => Some(state),
                _ => None,
            })
            .collect();

        for rule in &self.rules {
            match &rule.target {
                RuleTarget::State(state) => match evaluate(rule) {
                    Ok(value) if value.is_truthy() => return Some(*state),
                    Ok(_) => {}
                    Err(e) => warn!("state rule {} failed: {}", rule.name, e),
                },
                RuleTarget::Composite => match evaluate(rule) {
                    Ok(value) => {
                        let candidate = state_code(&value).and_then(DevState::from_code);
                        match candidate {
                            Some(state) if !listed.contains(&state) => return Some(state),
                            Some(_) => {}
                            None => debug!("state rule {} yields no state code: {}", rule.name, value),
                        }
                    }
                    Err(e) => warn!("state rule {} failed: {}", rule.name, e),
                },
                RuleTarget::Unknown(target) => {
                    let e = FormulaError::UnknownRuleTarget {
                        rule: rule.name.clone(),
                        target: target.clone(),
                    };
                    warn!("{}", e);
                }
            }
        }
        None
    }
}

// int() of the formula result
fn state_code(value: &Value) -> Option<i64> {
    let value = value.inner();
    value.as_integer().or_else(|| {
        value
            .to_f64()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64)
    })
}
