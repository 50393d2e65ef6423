use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dynattr::event_bus::{Event, EventReceiver};
use dynattr::{
    AttrQuality, ChangeThresholds, DevState, EngineConfig, EvalError, FormulaEngine, FormulaError,
    ManualClock, NameKey, Timestamp, Value,
};
use pretty_assertions::assert_eq;

fn engine_with(config: EngineConfig) -> (FormulaEngine, ManualClock) {
    let clock = ManualClock::new(Timestamp::from_secs_f64(1_700_000_000.0));
    let engine = FormulaEngine::new(config).with_clock(Arc::new(clock.clone()));
    (engine, clock)
}

fn evaluations(engine: &FormulaEngine, name: &str) -> u64 {
    engine.stats(name).map(|s| s.evaluations).unwrap_or_default()
}

fn drain_changes(rx: &mut EventReceiver) -> Vec<Value> {
    let mut values = Vec::new();
    while let Some(event) = rx.try_recv() {
        if let Event::AttributeChanged { value: Ok(v), .. } = event {
            values.push(v);
        }
    }
    values
}

#[test]
fn test_without_ttl_every_read_executes() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("A", "1 + 1");

    for _ in 0..5 {
        assert_eq!(engine.read("A"), Ok(Value::Integer(2)));
    }
    assert_eq!(evaluations(&engine, "A"), 5);
}

#[test]
fn test_kept_value_is_served_inside_ttl() {
    let (engine, clock) = engine_with(EngineConfig::default());
    engine.define("A", "t");
    engine.set_keep("A", true);
    engine.set_ttl("A", Some(Duration::from_secs(5)));

    clock.advance(Duration::from_secs(1));
    let first = engine.read("A").unwrap();
    let stored = engine.attribute_value("A").unwrap();

    clock.advance(Duration::from_millis(4900));
    let second = engine.read("A").unwrap();
    let cached = engine.attribute_value("A").unwrap();

    assert_eq!(first, second);
    assert_eq!(evaluations(&engine, "A"), 1);
    assert_eq!(stored.value, cached.value);
    assert_eq!(stored.quality, cached.quality);
    assert_eq!(stored.timestamp, cached.timestamp);

    clock.advance(Duration::from_millis(100));
    assert_eq!(engine.read("A"), Ok(Value::Float(6.0)));
    assert_eq!(evaluations(&engine, "A"), 2);
}

#[test]
fn test_dependency_change_propagates_after_ttl() {
    let (engine, clock) = engine_with(EngineConfig::default());
    engine.define("A", "X + 1");
    engine.define("B", "A * 2");
    engine.set_ttl("A", Some(Duration::from_secs(1)));
    engine.set_variable("X", Some(Value::Integer(1)));

    assert_eq!(engine.read("B"), Ok(Value::Integer(4)));

    engine.set_variable("X", Some(Value::Integer(10)));
    assert_eq!(engine.read("B"), Ok(Value::Integer(4)));

    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.read("B"), Ok(Value::Integer(22)));
    assert_eq!(evaluations(&engine, "A"), 2);
    assert_eq!(evaluations(&engine, "B"), 3);
}

#[test]
fn test_error_propagates_to_dependents() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("A", "1 / 0");
    engine.define("B", "A + 1");
    engine.define("C", "42 if True else A");

    let err = engine.read("A").unwrap_err();
    assert!(matches!(err, FormulaError::Evaluation { .. }));
    let a = engine.attribute_value("A").unwrap();
    assert_eq!(a.quality, AttrQuality::Invalid);
    assert_eq!(a.value, Err(err.clone()));

    match engine.read("B") {
        Err(FormulaError::Dependency {
            name,
            dependency,
            source,
        }) => {
            assert_eq!(name, "B");
            assert_eq!(dependency, "A");
            assert_eq!(*source, err);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    let b = engine.attribute_value("B").unwrap();
    assert_eq!(b.value, a.value);
    assert_eq!(b.quality, AttrQuality::Invalid);

    // a dependency that is never touched does not fail the formula
    assert_eq!(engine.read("C"), Ok(Value::Integer(42)));
}

#[test]
fn test_failed_attribute_is_retried_on_next_read() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("A", "100 / X");
    engine.set_ttl("A", Some(Duration::from_secs(60)));
    engine.set_variable("X", Some(Value::Integer(0)));

    assert!(engine.read("A").is_err());
    engine.set_variable("X", Some(Value::Integer(4)));
    assert_eq!(engine.read("A"), Ok(Value::Float(25.0)));
    assert_eq!(engine.stats("A").unwrap().failures, 1);
}

#[test]
fn test_absolute_threshold_gates_notification() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("T", "VAR('x')");
    engine.set_thresholds("T", ChangeThresholds::absolute(2.0));
    let (mut rx, _) = engine.subscribe();

    engine.set_variable("x", Some(Value::Integer(10)));
    engine.read("T").unwrap();
    assert!(!engine.changed("T", &Value::Integer(11)));
    assert!(engine.changed("T", &Value::Integer(13)));

    for x in [11, 14] {
        engine.set_variable("x", Some(Value::Integer(x)));
        engine.read("T").unwrap();
    }
    assert_eq!(
        drain_changes(&mut rx),
        vec![Value::Integer(10), Value::Integer(14)]
    );
}

#[test]
fn test_relative_threshold_gates_notification() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("T", "VAR('x')");
    engine.set_thresholds("T", ChangeThresholds::relative(10.0));
    let (mut rx, _) = engine.subscribe();

    engine.set_variable("x", Some(Value::Integer(100)));
    engine.read("T").unwrap();
    assert!(!engine.changed("T", &Value::Integer(109)));
    assert!(engine.changed("T", &Value::Integer(111)));

    for x in [109, 111] {
        engine.set_variable("x", Some(Value::Integer(x)));
        engine.read("T").unwrap();
    }
    // the stored value follows every evaluation, so 111 is compared against 109
    assert_eq!(drain_changes(&mut rx), vec![Value::Integer(100)]);
}

#[test]
fn test_first_matching_state_rule_wins() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine
        .load_state_rules("ALARM = X > 10\nFAULT = X < 0\nON = 1")
        .unwrap();
    engine.set_variable("X", Some(Value::Integer(15)));

    assert_eq!(engine.tick_state(), DevState::Alarm);
    assert_eq!(engine.state(), DevState::Alarm);

    engine.set_variable("X", Some(Value::Integer(-3)));
    assert_eq!(engine.tick_state(), DevState::Fault);
}

#[test]
fn test_state_is_kept_when_no_rule_matches() {
    let mut config = EngineConfig::default();
    config.initial_state = DevState::Standby;
    let (engine, _) = engine_with(config);
    engine.load_state_rules("ALARM = X > 10").unwrap();
    engine.set_variable("X", Some(Value::Integer(1)));

    assert_eq!(engine.tick_state(), DevState::Standby);
}

#[test]
fn test_first_read_always_executes() {
    let mut config = EngineConfig::default();
    config.default_ttl = Duration::from_secs(3600);
    let (engine, _) = engine_with(config);
    engine.define("A", "5");
    engine.set_keep("A", true);

    assert!(engine.attribute_value("A").is_none());
    assert_eq!(engine.read("A"), Ok(Value::Integer(5)));
    assert_eq!(evaluations(&engine, "A"), 1);
}

#[test]
fn test_quality_rule_with_wildcard() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine
        .load_quality_rules("T_.* = ALARM if VALUE>10 else VALID")
        .unwrap();

    engine.define("T_1", "15");
    engine.read("T_1").unwrap();
    assert_eq!(engine.attribute_value("T_1").unwrap().quality, AttrQuality::Alarm);

    engine.redefine("T_1", "5");
    engine.read("T_1").unwrap();
    assert_eq!(engine.attribute_value("T_1").unwrap().quality, AttrQuality::Valid);

    engine.define("Other", "15");
    engine.read("Other").unwrap();
    assert_eq!(engine.attribute_value("Other").unwrap().quality, AttrQuality::Valid);
}

#[test]
fn test_end_to_end_declarations() {
    let mut config = EngineConfig::default();
    config.default_ttl = Duration::from_secs(5);
    let (engine, clock) = engine_with(config);
    engine.load_attributes("A=3*2\nB=A+1").unwrap();

    assert_eq!(engine.read("B"), Ok(Value::Integer(7)));
    assert_eq!(evaluations(&engine, "A"), 1);
    assert_eq!(evaluations(&engine, "B"), 1);

    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.read("B"), Ok(Value::Integer(7)));
    assert_eq!(evaluations(&engine, "A"), 1);
    assert_eq!(evaluations(&engine, "B"), 1);

    clock.advance(Duration::from_secs(3));
    assert_eq!(engine.read("B"), Ok(Value::Integer(7)));
    assert_eq!(evaluations(&engine, "A"), 2);
    assert_eq!(evaluations(&engine, "B"), 2);
}

#[test]
fn test_write_keeps_prior_value_for_change_detection() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("Setpoint", "VAR('sp', VALUE) if WRITE else VAR('sp')");
    engine.set_thresholds("Setpoint", ChangeThresholds::absolute(2.0));
    let (mut rx, _) = engine.subscribe();

    engine.set_variable("sp", Some(Value::Integer(10)));
    engine.read("Setpoint").unwrap();
    assert_eq!(engine.write("Setpoint", Value::Integer(11)), Ok(Value::Integer(11)));
    assert_eq!(engine.read("Setpoint"), Ok(Value::Integer(11)));

    assert_eq!(drain_changes(&mut rx), vec![Value::Integer(10)]);
}

#[test]
fn test_write_runs_while_cached_value_is_fresh() {
    let (engine, clock) = engine_with(EngineConfig::default());
    engine.define("Setpoint", "VAR('sp', VALUE) if WRITE else VAR('sp')");
    engine.set_keep("Setpoint", true);
    engine.set_ttl("Setpoint", Some(Duration::from_secs(60)));

    engine.set_variable("sp", Some(Value::Integer(1)));
    assert_eq!(engine.read("Setpoint"), Ok(Value::Integer(1)));
    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.read("Setpoint"), Ok(Value::Integer(1)));
    assert_eq!(evaluations(&engine, "Setpoint"), 1);

    assert_eq!(engine.write("Setpoint", Value::Integer(5)), Ok(Value::Integer(5)));
    assert_eq!(evaluations(&engine, "Setpoint"), 2);
    assert_eq!(engine.variable("sp"), Some(Value::Integer(5)));

    // the written value is not served from the store
    assert_eq!(engine.read("Setpoint"), Ok(Value::Integer(5)));
    assert_eq!(evaluations(&engine, "Setpoint"), 3);
}

#[test]
fn test_dependencies_are_frozen_after_first_evaluation() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("A", "1");
    engine.define("B", "A + Late");
    engine.set_variable("late", Some(Value::Integer(5)));

    assert_eq!(engine.read("B"), Ok(Value::Integer(6)));
    let frozen: BTreeSet<NameKey> = [NameKey::new("A")].into_iter().collect();
    assert_eq!(engine.dependencies("B"), Some(frozen.clone()));

    engine.define("Late", "100");
    assert_eq!(engine.read("B"), Ok(Value::Integer(101)));
    assert_eq!(engine.dependencies("B"), Some(frozen));

    engine.redefine("B", "A + Late");
    engine.read("B").unwrap();
    assert!(engine.dependencies("B").unwrap().contains("late"));
}

#[test]
fn test_oversized_repetition_fails_without_looking_cyclic() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.define("S", "'ab' * 9223372036854775807");

    for _ in 0..2 {
        match engine.read("S") {
            Err(FormulaError::Evaluation {
                source: EvalError::Eval(message),
                ..
            }) => assert!(!message.contains("cyclic"), "{}", message),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
