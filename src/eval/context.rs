use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::error::FormulaError;
use crate::engine::names::NameKey;
use crate::timestamp::Timestamp;

use super::value::Value;
use super::{EvalError, EvalResult};

/// What a name is bound to while a formula runs.
///
/// A failed attribute is still bound: the formula only fails if it actually reads it.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Value(Value),
    Failed(FormulaError),
}

/// Variable lookup and helper dispatch for the interpreter.
///
/// The evaluator never touches engine state directly; everything a formula can see or
/// call goes through this trait.
pub trait Environment {
    fn lookup(&self, name: &str) -> EvalResult<Value>;

    /// Helper functions provided by the host. `None` means "not a helper", the
    /// evaluator then falls back to its builtins.
    fn call(&self, _function: &str, _arguments: &[Value]) -> Option<EvalResult<Value>> {
        None
    }

    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    variables: HashMap<NameKey, Binding>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: Arc<Scope>) -> Self {
        Self {
            variables: HashMap::new(),
            parent: Some(parent),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        let key = NameKey::new(name);
        self.get_key(&key)
    }

    fn get_key(&self, key: &NameKey) -> Option<&Binding> {
        match self.variables.get(key) {
            Some(binding) => Some(binding),
            None => self.parent.as_ref().and_then(|p| p.get_key(key)),
        }
    }

    /// Resolves a binding into a value, turning a failed binding into a dependency
    /// error.
    pub fn resolve(&self, name: &str) -> Option<EvalResult<Value>> {
        self.get(name).map(|binding| match binding {
            Binding::Value(value) => Ok(value.clone()),
            Binding::Failed(error) => Err(EvalError::Dependency {
                dependency: name.to_string(),
                source: Box::new(error.clone()),
            }),
        })
    }

    pub fn insert(&mut self, name: &str, value: Value) -> Option<Binding> {
        self.variables
            .insert(NameKey::new(name), Binding::Value(value))
    }

    pub fn bind(&mut self, name: &str, binding: Binding) -> Option<Binding> {
        self.variables.insert(NameKey::new(name), binding)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }
}

impl Environment for Scope {
    fn lookup(&self, name: &str) -> EvalResult<Value> {
        self.resolve(name)
            .unwrap_or_else(|| Err(EvalError::UndefinedVariable(name.to_string())))
    }
}
