use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dynattr::engine::helpers::MockDeviceProxy;
use dynattr::{
    AttrQuality, DeviceProxy, EngineConfig, EvalError, FormulaEngine, FormulaError, ManualClock,
    ProxyError, Timestamp, Value,
};

fn engine_with(proxy: MockDeviceProxy) -> (FormulaEngine, ManualClock) {
    let clock = ManualClock::new(Timestamp::from_secs_f64(1_700_000_000.0));
    let engine = FormulaEngine::new(EngineConfig::default())
        .with_clock(Arc::new(clock.clone()))
        .with_proxy(Arc::new(proxy));
    (engine, clock)
}

#[test]
fn test_external_read_carries_quality_and_timestamp() {
    let acquired = Timestamp::from_secs_f64(1_699_999_990.0);
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_read_attribute()
        .withf(|name| name == "sys/tg/1/ampli")
        .times(1)
        .returning(move |_| {
            Ok(Value::reading(
                Value::Float(1.5),
                AttrQuality::Alarm,
                Some(acquired),
            ))
        });
    let (engine, _) = engine_with(proxy);
    engine.define("Ampli", "XATTR('sys/tg/1/ampli')");

    assert_eq!(engine.read("Ampli"), Ok(Value::Float(1.5)));
    let stored = engine.attribute_value("Ampli").unwrap();
    assert_eq!(stored.quality, AttrQuality::Alarm);
    assert_eq!(stored.timestamp, acquired);
}

#[test]
fn test_arithmetic_on_external_reading() {
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_read_attribute()
        .returning(|_| Ok(Value::reading(Value::Integer(20), AttrQuality::Warning, None)));
    let (engine, _) = engine_with(proxy);
    engine.define("Double", "XATTR('dev/x') * 2");

    assert_eq!(engine.read("Double"), Ok(Value::Integer(40)));
}

#[test]
fn test_failed_external_read_is_throttled() {
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_read_attribute()
        .withf(|name| name == "dev/t")
        .times(2)
        .returning(|name| Err(ProxyError::Unreachable(name.to_string())));
    let (engine, clock) = engine_with(proxy);
    engine.define("T", "XATTR('dev/t', -1)");

    assert_eq!(engine.read("T"), Ok(Value::Integer(-1)));
    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.read("T"), Ok(Value::Integer(-1)));
    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.read("T"), Ok(Value::Integer(-1)));
}

#[test]
fn test_failed_external_read_without_default() {
    let mut proxy = MockDeviceProxy::new();
    proxy.expect_read_attribute().returning(|name| {
        Err(ProxyError::Failed {
            name: name.to_string(),
            message: "timeout".to_string(),
        })
    });
    let (engine, _) = engine_with(proxy);
    engine.define("T", "XATTR('dev/t')");

    match engine.read("T") {
        Err(FormulaError::Evaluation {
            source: EvalError::External(message),
            ..
        }) => assert!(message.contains("timeout")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_write_forwards_to_device() {
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_write_attribute()
        .withf(|name, value| name == "dev/setpoint" && *value == Value::Integer(5))
        .times(1)
        .returning(|_, _| Ok(()));
    proxy
        .expect_read_attribute()
        .withf(|name| name == "dev/setpoint")
        .returning(|_| Ok(Value::Integer(5)));
    let (engine, _) = engine_with(proxy);
    engine.define(
        "Setpoint",
        "WATTR('dev/setpoint', VALUE) if WRITE else XATTR('dev/setpoint')",
    );

    assert!(engine.definition("Setpoint").unwrap().writable);
    assert_eq!(engine.write("Setpoint", Value::Integer(5)), Ok(Value::Integer(5)));
    assert_eq!(engine.read("Setpoint"), Ok(Value::Integer(5)));
}

#[test]
fn test_command_with_expected_feedback() {
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_command()
        .withf(|name, argument| name == "Open" && *argument == Value::Null)
        .times(1)
        .returning(|_, _| Ok(Value::Null));
    proxy
        .expect_read_attribute()
        .withf(|name| name == "State")
        .times(1)
        .returning(|_| Ok(Value::String("OPEN".to_string())));
    let (engine, _) = engine_with(proxy);

    assert_eq!(
        engine.evaluate_formula("COMMAND('Open', None, 'State', 'OPEN')"),
        Ok(Value::Boolean(true))
    );
}

#[test]
fn test_command_result_without_feedback() {
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_command()
        .withf(|name, argument| name == "Reset" && *argument == Value::Integer(1))
        .returning(|_, _| Ok(Value::String("done".to_string())));
    let (engine, _) = engine_with(proxy);

    assert_eq!(
        engine.evaluate_formula("COMMAND('Reset', 1)"),
        Ok(Value::String("done".to_string()))
    );
}

#[test]
fn test_external_read_without_proxy_uses_default() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.define("T", "XATTR('dev/t', 0)");
    assert_eq!(engine.read("T"), Ok(Value::Integer(0)));

    engine.define("U", "XATTR('dev/u')");
    assert!(engine.read("U").is_err());
}

#[test]
fn test_failed_write_and_command_are_throttled() {
    let mut proxy = MockDeviceProxy::new();
    proxy
        .expect_write_attribute()
        .times(2)
        .returning(|name, _| Err(ProxyError::Unreachable(name.to_string())));
    proxy
        .expect_command()
        .withf(|name, _| name == "Reset")
        .times(1)
        .returning(|name, _| Err(ProxyError::Unreachable(name.to_string())));
    let (engine, clock) = engine_with(proxy);

    for _ in 0..3 {
        assert!(engine.evaluate_formula("WATTR('dev/valve', 1)").is_err());
        assert!(engine.evaluate_formula("COMMAND('Reset')").is_err());
    }
    match engine.evaluate_formula("COMMAND('Reset')") {
        Err(FormulaError::Evaluation {
            source: EvalError::External(message),
            ..
        }) => assert!(message.contains("retry suppressed"), "{}", message),
        other => panic!("unexpected result: {:?}", other),
    }

    // a write is retried once the period is over
    clock.advance(Duration::from_secs(4));
    assert!(engine.evaluate_formula("WATTR('dev/valve', 1)").is_err());
}

struct PanicOnce {
    panicked: AtomicBool,
}

impl DeviceProxy for PanicOnce {
    fn read_attribute(&self, name: &str) -> Result<Value, ProxyError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("driver crashed reading {}", name);
        }
        Ok(Value::Integer(7))
    }

    fn write_attribute(&self, _name: &str, _value: Value) -> Result<(), ProxyError> {
        Ok(())
    }

    fn command(&self, _name: &str, _argument: Value) -> Result<Value, ProxyError> {
        Ok(Value::Null)
    }
}

#[test]
fn test_panic_during_evaluation_does_not_leave_attribute_cyclic() {
    let engine = FormulaEngine::new(EngineConfig::default()).with_proxy(Arc::new(PanicOnce {
        panicked: AtomicBool::new(false),
    }));
    engine.define("T", "XATTR('dev/t')");

    let crashed = panic::catch_unwind(AssertUnwindSafe(|| engine.read("T")));
    assert!(crashed.is_err());
    assert_eq!(engine.read("T"), Ok(Value::Integer(7)));
}
