use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use super::change::{outcome_changed, ChangeThresholds};
use super::compiler::{compile, CompiledFormula, FormulaCache};
use super::declaration::{parse_attributes, parse_rules, parse_status, split_type_tag, TypeTag};
use super::dependency::extract_dependencies;
use super::error::{FormulaError, FormulaResult};
use super::helpers::{arity, external, name_argument, DeviceProxy, Helper, RetryThrottle};
use super::names::NameKey;
use super::quality::{default_quality, quality_from_value, QualityDeriver, QualityRule};
use super::state::{RuleTarget, StateMachine, StateRule};
use super::store::{AttributeValue, ValueStore};
use crate::config::EngineConfig;
use crate::eval::{
    AttrQuality, Binding, DevState, Environment, EvalError, EvalResult, ExpressionEvaluator,
    Scope, Value,
};
use crate::event_bus::{ErrorEvent, ErrorReceiver, Event, EventBus, EventReceiver};
use crate::timestamp::{Clock, SystemClock, Timestamp};
use crate::InternalResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    pub evaluations: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct AttributeDefinition {
    pub name: String,
    pub formula: CompiledFormula,
    pub type_tag: Option<TypeTag>,
    /// The formula references `VALUE` or `WRITE`.
    pub writable: bool,
    pub keep: bool,
    pub ttl: Option<Duration>,
    pub notify: bool,
    pub thresholds: ChangeThresholds,
    dependencies: Option<BTreeSet<NameKey>>,
    stats: EvaluationStats,
}

impl AttributeDefinition {
    fn new(name: &str, formula: &str, type_tag: Option<TypeTag>, config: &EngineConfig) -> Self {
        let attribute = config.attribute(name);
        let mut definition = Self {
            name: name.to_string(),
            formula: compile(name, formula),
            type_tag,
            writable: false,
            keep: config.is_kept(name),
            ttl: attribute.and_then(|a| a.ttl),
            notify: attribute
                .and_then(|a| a.notify)
                .unwrap_or(config.notify_changes),
            thresholds: attribute.map(|a| a.thresholds()).unwrap_or_default(),
            dependencies: None,
            stats: EvaluationStats::default(),
        };
        definition.writable = definition.detect_writable();
        definition
    }

    fn replace_formula(&mut self, formula: &str, type_tag: Option<TypeTag>) {
        self.formula = compile(&self.name, formula);
        self.type_tag = type_tag;
        self.writable = self.detect_writable();
        self.dependencies = None;
    }

    fn detect_writable(&self) -> bool {
        self.formula.references("VALUE") || self.formula.references("WRITE")
    }

    /// Frozen dependency set, once the attribute has been evaluated.
    pub fn dependencies(&self) -> Option<&BTreeSet<NameKey>> {
        self.dependencies.as_ref()
    }

    pub fn stats(&self) -> EvaluationStats {
        self.stats
    }
}

struct EngineState {
    definitions: HashMap<NameKey, AttributeDefinition>,
    order: Vec<NameKey>,
    store: ValueStore,
    states: StateMachine,
    qualities: QualityDeriver,
    status: Vec<CompiledFormula>,
    forced: HashMap<NameKey, Value>,
    variables: HashMap<NameKey, Value>,
    adhoc: FormulaCache,
    in_progress: Vec<NameKey>,
}

impl EngineState {
    fn new(initial: DevState) -> Self {
        Self {
            definitions: HashMap::new(),
            order: Vec::new(),
            store: ValueStore::new(),
            states: StateMachine::new(initial),
            qualities: QualityDeriver::new(),
            status: Vec::new(),
            forced: HashMap::new(),
            variables: HashMap::new(),
            adhoc: FormulaCache::default(),
            in_progress: Vec::new(),
        }
    }
}

/// Marks an attribute as being evaluated. The mark is removed on drop, so a panicking
/// formula cannot leave its attribute looking cyclic.
struct InProgress<'a> {
    state: &'a ReentrantMutex<RefCell<EngineState>>,
}

impl<'a> InProgress<'a> {
    fn enter(state: &'a ReentrantMutex<RefCell<EngineState>>, key: &NameKey) -> Self {
        state.lock().borrow_mut().in_progress.push(key.clone());
        Self { state }
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        let guard = self.state.lock();
        if let Ok(mut state) = guard.try_borrow_mut() {
            state.in_progress.pop();
        };
    }
}

// what one evaluation needs from the definition, copied out of the state
struct Plan {
    name: String,
    formula: CompiledFormula,
    type_tag: Option<TypeTag>,
    writable: bool,
    ttl: Duration,
    notify: bool,
    thresholds: ChangeThresholds,
}

/// Formula-driven attributes of one context.
///
/// All state lives behind one reentrant lock: evaluation is synchronous and a formula
/// may evaluate other attributes of the same engine on the same thread. Evaluating from
/// inside a formula on another thread deadlocks.
pub struct FormulaEngine {
    state: ReentrantMutex<RefCell<EngineState>>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    proxy: Option<Arc<dyn DeviceProxy>>,
    throttle: RetryThrottle,
    event_bus: Arc<EventBus>,
    evaluator: ExpressionEvaluator,
    started: Timestamp,
    constants: Arc<Scope>,
    quality_constants: Arc<Scope>,
}

impl FormulaEngine {
    pub fn new(config: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let started = clock.now();
        let constants = Arc::new(constant_scope());
        let quality_constants = Arc::new(quality_scope(constants.clone()));
        Self {
            state: ReentrantMutex::new(RefCell::new(EngineState::new(config.initial_state))),
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            throttle: RetryThrottle::new(),
            proxy: None,
            evaluator: ExpressionEvaluator::new(),
            clock,
            started,
            constants,
            quality_constants,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.started = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn DeviceProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        self.event_bus.subscribe()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // definitions

    /// Registers an attribute, or replaces the formula of an existing one. A leading type
    /// tag is stripped from the formula and applied to results.
    pub fn define(&self, name: &str, formula: &str) {
        let (type_tag, formula) = split_type_tag(formula);
        self.define_typed(name, formula, type_tag);
    }

    pub fn define_typed(&self, name: &str, formula: &str, type_tag: Option<TypeTag>) {
        if self.redefine_typed(name, formula, type_tag) {
            return;
        }
        let definition = AttributeDefinition::new(name, formula, type_tag, &self.config);
        if definition.formula.is_broken() {
            debug!("{} registered with a broken formula", name);
        }
        let key = NameKey::new(name);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.definitions.insert(key.clone(), definition);
        state.order.push(key);
    }

    /// Replaces the formula of a registered attribute. Its dependencies are extracted
    /// again on the next evaluation. Returns false for an unknown name.
    pub fn redefine(&self, name: &str, formula: &str) -> bool {
        let (type_tag, formula) = split_type_tag(formula);
        self.redefine_typed(name, formula, type_tag)
    }

    fn redefine_typed(&self, name: &str, formula: &str, type_tag: Option<TypeTag>) -> bool {
        let key = NameKey::new(name);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(definition) = state.definitions.get_mut(&key) else {
            return false;
        };
        definition.replace_formula(formula, type_tag);
        debug!("{} redefined as {}", definition.name, formula);
        state.store.invalidate(&key);
        true
    }

    pub fn undefine(&self, name: &str) -> bool {
        let key = NameKey::new(name);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.definitions.remove(&key).is_none() {
            return false;
        }
        state.order.retain(|k| k != &key);
        state.store.invalidate(&key);
        state.forced.remove(&key);
        true
    }

    pub fn is_defined(&self, name: &str) -> bool {
        let guard = self.state.lock();
        let defined = guard.borrow().definitions.contains_key(&NameKey::new(name));
        defined
    }

    /// Attribute names in declaration order, as declared.
    pub fn attribute_names(&self) -> Vec<String> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .order
            .iter()
            .filter_map(|key| state.definitions.get(key))
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn definition(&self, name: &str) -> Option<AttributeDefinition> {
        let guard = self.state.lock();
        let definition = guard.borrow().definitions.get(&NameKey::new(name)).cloned();
        definition
    }

    pub fn dependencies(&self, name: &str) -> Option<BTreeSet<NameKey>> {
        self.definition(name)
            .and_then(|d| d.dependencies().cloned())
    }

    pub fn stats(&self, name: &str) -> Option<EvaluationStats> {
        self.definition(name).map(|d| d.stats())
    }

    pub fn attribute_value(&self, name: &str) -> Option<AttributeValue> {
        let guard = self.state.lock();
        let value = guard.borrow().store.get(&NameKey::new(name)).cloned();
        value
    }

    pub fn is_kept(&self, name: &str) -> bool {
        self.definition(name).is_some_and(|d| d.keep)
    }

    pub fn effective_ttl(&self, name: &str) -> Option<Duration> {
        self.definition(name)
            .map(|d| d.ttl.unwrap_or(self.config.default_ttl))
    }

    /// Attributes the periodic refresher walks: kept ones and those with a TTL.
    pub fn refreshable_attributes(&self) -> Vec<String> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .order
            .iter()
            .filter_map(|key| state.definitions.get(key))
            .filter(|d| d.keep || !d.ttl.unwrap_or(self.config.default_ttl).is_zero())
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn set_ttl(&self, name: &str, ttl: Option<Duration>) -> bool {
        self.update_definition(name, |d| d.ttl = ttl)
    }

    pub fn set_keep(&self, name: &str, keep: bool) -> bool {
        self.update_definition(name, |d| d.keep = keep)
    }

    pub fn set_notify(&self, name: &str, notify: bool) -> bool {
        self.update_definition(name, |d| d.notify = notify)
    }

    pub fn set_thresholds(&self, name: &str, thresholds: ChangeThresholds) -> bool {
        self.update_definition(name, |d| d.thresholds = thresholds)
    }

    fn update_definition<F>(&self, name: &str, update: F) -> bool
    where
        F: FnOnce(&mut AttributeDefinition),
    {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match state.definitions.get_mut(&NameKey::new(name)) {
            Some(definition) => {
                update(definition);
                true
            }
            None => false,
        }
    }

    // declarations

    /// Registers every `NAME=FORMULA` line and returns the declared names.
    pub fn load_attributes(&self, text: &str) -> InternalResult<Vec<String>> {
        let declarations = parse_attributes(text)?;
        Ok(declarations
            .into_iter()
            .map(|d| {
                self.define_typed(&d.name, &d.formula, d.type_tag);
                d.name
            })
            .collect())
    }

    /// Replaces the state rules. Declaration order is priority order.
    pub fn load_state_rules(&self, text: &str) -> InternalResult<usize> {
        let rules: Vec<StateRule> = parse_rules(text)?
            .iter()
            .map(|r| StateRule::new(&r.name, &r.formula))
            .collect();
        for rule in &rules {
            if let RuleTarget::Unknown(target) = &rule.target {
                warn!(
                    "{}",
                    FormulaError::UnknownRuleTarget {
                        rule: rule.name.clone(),
                        target: target.clone(),
                    }
                );
            }
        }
        let count = rules.len();
        let guard = self.state.lock();
        guard.borrow_mut().states.set_rules(rules);
        Ok(count)
    }

    pub fn add_state_rule(&self, state: &str, formula: &str) {
        let guard = self.state.lock();
        guard
            .borrow_mut()
            .states
            .add_rule(StateRule::new(state, formula));
    }

    /// Replaces the quality rules. The first matching pattern wins.
    pub fn load_quality_rules(&self, text: &str) -> InternalResult<usize> {
        let rules = parse_rules(text)?
            .iter()
            .map(|r| QualityRule::new(&r.name, &r.formula))
            .collect::<FormulaResult<Vec<_>>>()?;
        let count = rules.len();
        let guard = self.state.lock();
        guard.borrow_mut().qualities.set_rules(rules);
        Ok(count)
    }

    pub fn add_quality_rule(&self, pattern: &str, formula: &str) -> FormulaResult<()> {
        let rule = QualityRule::new(pattern, formula)?;
        let guard = self.state.lock();
        guard.borrow_mut().qualities.add_rule(rule);
        Ok(())
    }

    /// Replaces the status formulas, one per line.
    pub fn load_status(&self, text: &str) -> usize {
        let lines: Vec<CompiledFormula> = parse_status(text)
            .iter()
            .map(|formula| compile("Status", formula))
            .collect();
        let count = lines.len();
        let guard = self.state.lock();
        guard.borrow_mut().status = lines;
        count
    }

    // overrides and scratch variables

    /// Sets or clears (`None`) a value served by reads instead of the formula.
    pub fn force(&self, name: &str, value: Option<Value>) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let key = NameKey::new(name);
        match value {
            Some(value) => state.forced.insert(key, value),
            None => state.forced.remove(&key),
        };
    }

    pub fn forced(&self, name: &str) -> Option<Value> {
        let guard = self.state.lock();
        let value = guard.borrow().forced.get(&NameKey::new(name)).cloned();
        value
    }

    /// Sets or clears a scratch variable. Variables are visible to formulas by name.
    pub fn set_variable(&self, name: &str, value: Option<Value>) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let key = NameKey::new(name);
        match value {
            Some(value) => state.variables.insert(key, value),
            None => state.variables.remove(&key),
        };
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        let guard = self.state.lock();
        let value = guard.borrow().variables.get(&NameKey::new(name)).cloned();
        value
    }

    // evaluation

    pub fn read(&self, name: &str) -> FormulaResult<Value> {
        self.evaluate(name, AccessMode::Read, None)
    }

    pub fn write(&self, name: &str, value: Value) -> FormulaResult<Value> {
        self.evaluate(name, AccessMode::Write, Some(value))
    }

    /// Reads or writes an attribute.
    ///
    /// A read inside the TTL window is served from the store. Otherwise every dependency
    /// is refreshed first, the formula runs, and the outcome is stored, errors included.
    /// An unregistered name is evaluated as a formula of its own and nothing is stored.
    #[tracing::instrument(level = "debug", skip(self, write_value))]
    pub fn evaluate(
        &self,
        name: &str,
        mode: AccessMode,
        write_value: Option<Value>,
    ) -> FormulaResult<Value> {
        let guard = self.state.lock();
        let key = NameKey::new(name);
        let now = self.clock.now();

        let plan = guard.borrow().definitions.get(&key).map(|d| Plan {
            name: d.name.clone(),
            formula: d.formula.clone(),
            type_tag: d.type_tag,
            writable: d.writable,
            ttl: d.ttl.unwrap_or(self.config.default_ttl),
            notify: d.notify,
            thresholds: d.thresholds,
        });
        let Some(plan) = plan else {
            return match mode {
                AccessMode::Read => self.evaluate_formula(name),
                AccessMode::Write => Err(FormulaError::NotWritable(name.to_string())),
            };
        };

        if mode == AccessMode::Write && !plan.writable {
            return Err(FormulaError::NotWritable(plan.name));
        }

        if mode == AccessMode::Read {
            let served = {
                let state = guard.borrow();
                match state.forced.get(&key) {
                    Some(forced) => Some(Ok(forced.clone())),
                    None => state
                        .store
                        .fresh(&key, plan.ttl, now)
                        .map(|cached| cached.value.clone()),
                }
            };
            if let Some(served) = served {
                guard.borrow_mut().store.touch(&key, now);
                return served;
            }
        }

        let (cyclic, previous) = {
            let state = guard.borrow();
            (
                state.in_progress.contains(&key),
                state
                    .store
                    .get(&key)
                    .and_then(|v| v.value.as_ref().ok().cloned()),
            )
        };
        if cyclic {
            debug!("{} is already being evaluated", plan.name);
            return previous.ok_or_else(|| FormulaError::Evaluation {
                name: plan.name.clone(),
                source: EvalError::Eval(format!("cyclic dependency on {}", plan.name)),
            });
        }

        let outcome = {
            let _marker = InProgress::enter(&self.state, &key);
            self.execute(&key, &plan, mode, write_value, previous)
        };

        self.finish(&key, &plan, mode, outcome, now)
    }

    /// Evaluates formula text that is not an attribute. The compiled form is cached by
    /// text, up to `FormulaCache::DEFAULT_CAPACITY` formulas.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn evaluate_formula(&self, formula: &str) -> FormulaResult<Value> {
        let guard = self.state.lock();
        let unit = guard.borrow_mut().adhoc.get_or_compile(formula);
        self.run_detached(formula, &unit, &self.constants, Value::Null)
            .map(Value::into_inner)
    }

    /// Change detection against the stored value of an attribute.
    pub fn changed(&self, name: &str, value: &Value) -> bool {
        let key = NameKey::new(name);
        let guard = self.state.lock();
        let state = guard.borrow();
        let thresholds = state
            .definitions
            .get(&key)
            .map(|d| d.thresholds)
            .unwrap_or_default();
        let previous = state.store.get(&key).map(|v| &v.value);
        outcome_changed(previous, &Ok(value.clone()), &thresholds)
    }

    fn execute(
        &self,
        key: &NameKey,
        plan: &Plan,
        mode: AccessMode,
        write_value: Option<Value>,
        previous: Option<Value>,
    ) -> FormulaResult<Value> {
        let expression = plan.formula.expression()?;

        let value = match mode {
            AccessMode::Write => write_value.unwrap_or_default(),
            AccessMode::Read => previous.unwrap_or_default(),
        };
        let mut scope = Scope::with_parent(self.constants.clone());
        self.bind_locals(&mut scope, &plan.name, mode, value);

        for dependency in self.dependencies_of(key) {
            let binding = match self.evaluate(dependency.as_str(), AccessMode::Read, None) {
                Ok(value) => Binding::Value(value),
                Err(e) => Binding::Failed(e.root_cause().clone()),
            };
            scope.bind(dependency.as_str(), binding);
        }

        let env = EngineEnvironment::new(self, scope);
        let result = self
            .evaluator
            .eval_expression(&expression, &env)
            .map_err(|e| FormulaError::evaluation(&plan.name, e))?;
        match plan.type_tag {
            Some(tag) => tag
                .coerce(result)
                .map_err(|e| FormulaError::evaluation(&plan.name, e)),
            None => Ok(result),
        }
    }

    fn finish(
        &self,
        key: &NameKey,
        plan: &Plan,
        mode: AccessMode,
        outcome: FormulaResult<Value>,
        now: Timestamp,
    ) -> FormulaResult<Value> {
        self.update_definition(&plan.name, |d| {
            d.stats.evaluations += 1;
            if outcome.is_err() {
                d.stats.failures += 1;
            }
        });

        match outcome {
            Ok(value) if mode == AccessMode::Write => {
                // the next read recomputes
                let guard = self.state.lock();
                guard.borrow_mut().store.expire(key);
                Ok(value.into_inner())
            }
            Ok(value) => {
                let quality = self.derive_quality(key, &plan.name, &value);
                let timestamp = value.carried_timestamp().unwrap_or(now);
                let value = value.into_inner();
                self.store_outcome(
                    key,
                    plan,
                    AttributeValue::success(value.clone(), quality, timestamp, now),
                );
                let guard = self.state.lock();
                guard.borrow_mut().store.touch(key, now);
                Ok(value)
            }
            Err(error) => {
                warn!("{}", error);
                self.store_outcome(
                    key,
                    plan,
                    AttributeValue::failure(error.root_cause().clone(), now),
                );
                if self.event_bus.has_subscribers() {
                    let _ = self.event_bus.publish_error(ErrorEvent {
                        name: plan.name.clone(),
                        message: error.to_string(),
                        timestamp: now,
                    });
                }
                Err(error)
            }
        }
    }

    fn store_outcome(&self, key: &NameKey, plan: &Plan, stored: AttributeValue) {
        let guard = self.state.lock();
        let event = if plan.notify {
            let state = guard.borrow();
            let changed = match state.store.get(key) {
                Some(previous) => {
                    previous.quality != stored.quality
                        || outcome_changed(Some(&previous.value), &stored.value, &plan.thresholds)
                }
                None => true,
            };
            changed.then(|| Event::AttributeChanged {
                name: plan.name.clone(),
                value: stored.value.clone(),
                quality: stored.quality,
                timestamp: stored.timestamp,
            })
        } else {
            None
        };
        guard.borrow_mut().store.put(key.clone(), stored);
        if let Some(event) = event {
            self.publish(event);
        }
    }

    fn derive_quality(&self, key: &NameKey, name: &str, value: &Value) -> AttrQuality {
        let fallback = default_quality(value);
        let rule = {
            let guard = self.state.lock();
            let rule = guard.borrow_mut().qualities.rule_for(key);
            rule
        };
        let Some(unit) = rule else {
            return fallback;
        };
        match self.run_detached(name, &unit, &self.quality_constants, value.inner().clone()) {
            Ok(result) => quality_from_value(&result).unwrap_or_else(|| {
                warn!("quality rule of {} yields no quality: {}", name, result);
                fallback
            }),
            Err(e) => {
                warn!("quality rule of {} failed: {}", name, e);
                fallback
            }
        }
    }

    /// Dependencies are extracted on first use and frozen. Every dependency is promoted to
    /// kept so its value stays available.
    fn dependencies_of(&self, key: &NameKey) -> BTreeSet<NameKey> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let state = &mut *state;
        let Some(definition) = state.definitions.get(key) else {
            return BTreeSet::new();
        };
        if let Some(dependencies) = &definition.dependencies {
            return dependencies.clone();
        }
        let definitions = &state.definitions;
        let dependencies =
            extract_dependencies(key, &definition.formula, |k| definitions.contains_key(k));
        debug!("{} depends on {:?}", definition.name, dependencies);

        for dependency in &dependencies {
            if let Some(d) = state.definitions.get_mut(dependency) {
                d.keep = true;
            }
        }
        if let Some(d) = state.definitions.get_mut(key) {
            d.dependencies = Some(dependencies.clone());
        }
        dependencies
    }

    // state and status

    pub fn state(&self) -> DevState {
        let guard = self.state.lock();
        let current = guard.borrow().states.current();
        current
    }

    pub fn set_state(&self, state: DevState) {
        let guard = self.state.lock();
        let previous = guard.borrow_mut().states.set_state(state);
        if let Some(previous) = previous {
            self.publish(Event::StateChanged {
                previous,
                current: state,
            });
        }
    }

    /// Runs the state rules once. The first rule that holds sets the state; when none
    /// does the state is left as it was.
    pub fn tick_state(&self) -> DevState {
        let guard = self.state.lock();
        let machine = guard.borrow().states.clone();
        let selected = machine.select(|rule| {
            self.run_detached(&rule.name, &rule.formula, &self.constants, Value::Null)
        });
        match selected {
            Some(next) => {
                self.set_state(next);
                next
            }
            None => machine.current(),
        }
    }

    /// Status formulas evaluated and joined by newlines. Failing lines are logged and
    /// left out.
    pub fn status(&self) -> String {
        let guard = self.state.lock();
        let lines = guard.borrow().status.clone();
        lines
            .iter()
            .filter_map(|unit| {
                match self.run_detached("Status", unit, &self.constants, Value::Null) {
                    Ok(value) => Some(value.to_string()),
                    Err(e) => {
                        warn!("status line {} failed: {}", unit.source(), e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // formulas that are not attributes: rules, status lines, ad-hoc text
    fn run_detached(
        &self,
        name: &str,
        unit: &CompiledFormula,
        parent: &Arc<Scope>,
        value: Value,
    ) -> FormulaResult<Value> {
        let expression = unit.expression()?;
        let mut scope = Scope::with_parent(parent.clone());
        self.bind_locals(&mut scope, name, AccessMode::Read, value);
        let env = EngineEnvironment::new(self, scope);
        self.evaluator
            .eval_expression(&expression, &env)
            .map_err(|e| FormulaError::evaluation(name, e))
    }

    fn bind_locals(&self, scope: &mut Scope, name: &str, mode: AccessMode, value: Value) {
        let (current, attributes) = {
            let guard = self.state.lock();
            let state = guard.borrow();
            let attributes = state
                .order
                .iter()
                .filter_map(|key| state.definitions.get(key))
                .map(|d| Value::String(d.name.clone()))
                .collect::<Vec<_>>();
            (state.states.current(), attributes)
        };
        let elapsed = self.clock.now().since(&self.started);

        scope.insert("VALUE", value);
        scope.insert("WRITE", Value::Boolean(mode == AccessMode::Write));
        scope.insert("READ", Value::Boolean(mode == AccessMode::Read));
        scope.insert("NAME", Value::String(name.to_string()));
        scope.insert("STATE", Value::State(current));
        scope.insert("t", Value::Float(elapsed.as_secs_f64()));
        scope.insert("ATTRIBUTES", Value::List(attributes));
    }

    fn publish(&self, event: Event) {
        if !self.event_bus.has_subscribers() {
            return;
        }
        if let Err(e) = self.event_bus.publish(event) {
            debug!("event dropped: {}", e);
        }
    }

    // names not bound in the scope: attributes first, then scratch variables
    fn resolve_name(&self, name: &str) -> EvalResult<Value> {
        let key = NameKey::new(name);
        let (defined, variable) = {
            let guard = self.state.lock();
            let state = guard.borrow();
            (
                state.definitions.contains_key(&key),
                state.variables.get(&key).cloned(),
            )
        };
        if defined {
            return self.read_attribute(name);
        }
        variable.ok_or_else(|| EvalError::UndefinedVariable(name.to_string()))
    }

    fn read_attribute(&self, name: &str) -> EvalResult<Value> {
        self.evaluate(name, AccessMode::Read, None)
            .map_err(|e| EvalError::Dependency {
                dependency: name.to_string(),
                source: Box::new(e.root_cause().clone()),
            })
    }

    fn call_helper(&self, helper: Helper, args: &[Value]) -> EvalResult<Value> {
        match helper {
            Helper::Attr => {
                arity(helper, args, 1, 1)?;
                self.read_attribute(&name_argument(helper, args)?)
            }
            Helper::Xattr => {
                arity(helper, args, 1, 2)?;
                let name = name_argument(helper, args)?;
                self.read_external(&name, args.get(1).cloned())
            }
            Helper::Wattr => {
                arity(helper, args, 2, 2)?;
                let name = name_argument(helper, args)?;
                let value = args[1].inner().clone();
                self.throttled(&format!("WATTR {}", name), || {
                    self.proxy()?
                        .write_attribute(&name, value.clone())
                        .map_err(external)
                })?;
                Ok(value)
            }
            Helper::Command => {
                arity(helper, args, 1, 4)?;
                let name = name_argument(helper, args)?;
                self.throttled(&format!("COMMAND {}", name), || self.run_command(&name, args))
            }
            Helper::Force => {
                arity(helper, args, 1, 2)?;
                let name = name_argument(helper, args)?;
                match args.get(1).map(Value::inner) {
                    None => Ok(self.forced(&name).unwrap_or_default()),
                    Some(value) => {
                        let set = (!matches!(value, Value::Null)).then(|| value.clone());
                        self.force(&name, set);
                        Ok(value.clone())
                    }
                }
            }
            Helper::Var => {
                arity(helper, args, 1, 2)?;
                let name = name_argument(helper, args)?;
                match args.get(1).map(Value::inner) {
                    None => Ok(self.variable(&name).unwrap_or_default()),
                    Some(value) => {
                        let set = (!matches!(value, Value::Null)).then(|| value.clone());
                        self.set_variable(&name, set);
                        Ok(value.clone())
                    }
                }
            }
            Helper::Subeval => {
                arity(helper, args, 1, 1)?;
                let formula = name_argument(helper, args)?;
                self.evaluate_formula(&formula)
                    .map_err(|e| EvalError::Formula(Box::new(e)))
            }
        }
    }

    fn proxy(&self) -> EvalResult<&Arc<dyn DeviceProxy>> {
        self.proxy
            .as_ref()
            .ok_or_else(|| EvalError::External("no device proxy configured".to_string()))
    }

    fn read_external(&self, name: &str, default: Option<Value>) -> EvalResult<Value> {
        self.throttled(name, || {
            self.proxy()
                .and_then(|p| p.read_attribute(name).map_err(external))
        })
        .or_else(|e| default.ok_or(e))
    }

    /// Runs a device call unless the call under `key` failed within the external retry
    /// period.
    fn throttled<T, F>(&self, key: &str, call: F) -> EvalResult<T>
    where
        F: FnOnce() -> EvalResult<T>,
    {
        let now = self.clock.now();
        if self
            .throttle
            .is_throttled(key, now, self.config.external_retry_period)
        {
            debug!("{} suppressed after a recent failure", key);
            return Err(EvalError::External(format!(
                "{} failed recently, retry suppressed",
                key
            )));
        }
        match call() {
            Ok(value) => {
                self.throttle.record_success(key);
                Ok(value)
            }
            Err(e) => {
                warn!("external call {} failed: {}", key, e);
                self.throttle.record_failure(key, now);
                Err(e)
            }
        }
    }

    // COMMAND(name, argument, feedback, expected)
    fn run_command(&self, name: &str, args: &[Value]) -> EvalResult<Value> {
        let proxy = self.proxy()?;
        let argument = args.get(1).map(|v| v.inner().clone()).unwrap_or_default();
        let result = proxy.command(name, argument).map_err(external)?;

        let observed = match args.get(2).map(Value::inner) {
            Some(Value::String(feedback)) if !feedback.is_empty() => {
                proxy.read_attribute(feedback).map_err(external)?
            }
            _ => result,
        };
        match args.get(3).map(Value::inner) {
            None | Some(Value::Null) => Ok(observed),
            Some(expected) => Ok(Value::Boolean(observed.inner().loose_eq(expected))),
        }
    }
}

/// What formulas of one engine see: the bound scope, then attributes and scratch
/// variables of the engine, plus the helper functions.
struct EngineEnvironment<'a> {
    engine: &'a FormulaEngine,
    scope: Scope,
}

impl<'a> EngineEnvironment<'a> {
    fn new(engine: &'a FormulaEngine, scope: Scope) -> Self {
        Self { engine, scope }
    }
}

impl Environment for EngineEnvironment<'_> {
    fn lookup(&self, name: &str) -> EvalResult<Value> {
        match self.scope.resolve(name) {
            Some(result) => result,
            None => self.engine.resolve_name(name),
        }
    }

    fn call(&self, function: &str, arguments: &[Value]) -> Option<EvalResult<Value>> {
        let helper = Helper::from_str(function).ok()?;
        Some(self.engine.call_helper(helper, arguments))
    }

    fn now(&self) -> Timestamp {
        self.engine.clock.now()
    }
}

fn constant_scope() -> Scope {
    let mut scope = Scope::new();
    for state in <DevState as strum::IntoEnumIterator>::iter() {
        scope.insert(state.as_ref(), Value::State(state));
    }
    for quality in <AttrQuality as strum::IntoEnumIterator>::iter() {
        scope.insert(&quality.to_string(), Value::Quality(quality));
    }
    scope.insert("PI", Value::Float(std::f64::consts::PI));
    scope.insert("E", Value::Float(std::f64::consts::E));
    scope
}

// quality rules see bare quality names, shadowing the states of the same name
fn quality_scope(constants: Arc<Scope>) -> Scope {
    let mut scope = Scope::with_parent(constants);
    for quality in <AttrQuality as strum::IntoEnumIterator>::iter() {
        scope.insert(quality.short_name(), Value::Quality(quality));
    }
    scope
}
