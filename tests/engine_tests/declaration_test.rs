use std::time::Duration;

use dynattr::engine::declaration::DeclarationError;
use dynattr::{AttrQuality, DevState, EngineConfig, Error, FormulaEngine, Value};
use pretty_assertions::assert_eq;

const ATTRIBUTES: &str = r#"
# raw readings
Raw = VAR('raw')
Scaled = DevDouble(Raw * 0.1)   # tenths
Label = DevString(Scaled)
Limits = DevVarLongArray([1.9, 2, '3'])
Equal = Raw == 42
"#;

#[test]
fn test_load_attributes_in_declaration_order() {
    let engine = FormulaEngine::new(EngineConfig::default());
    let names = engine.load_attributes(ATTRIBUTES).unwrap();
    assert_eq!(names, vec!["Raw", "Scaled", "Label", "Limits", "Equal"]);
    assert_eq!(engine.attribute_names(), names);

    engine.set_variable("raw", Some(Value::Integer(42)));
    assert_eq!(engine.read("scaled"), Ok(Value::Float(4.2)));
    assert_eq!(engine.read("Label"), Ok(Value::String("4.2".to_string())));
    assert_eq!(
        engine.read("Limits"),
        Ok(Value::List(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3)
        ]))
    );
    assert_eq!(engine.read("Equal"), Ok(Value::Boolean(true)));
}

#[test]
fn test_attribute_list_is_visible_to_formulas() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.load_attributes("A = 1\nB = 2\nCount = len(ATTRIBUTES)").unwrap();
    assert_eq!(engine.read("Count"), Ok(Value::Integer(3)));
}

#[test]
fn test_malformed_declaration_is_rejected() {
    let engine = FormulaEngine::new(EngineConfig::default());
    match engine.load_attributes("A = 1\nthis line has no separator") {
        Err(Error::Declaration(DeclarationError::MissingSeparator { line, .. })) => {
            assert_eq!(line, 2)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!engine.is_defined("A"));
}

#[test]
fn test_broken_formula_registers_and_fails_on_read() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.load_attributes("Broken = (1 +\nFine = 2").unwrap();
    assert!(engine.is_defined("Broken"));
    assert!(engine.read("Broken").is_err());
    assert_eq!(engine.read("Fine"), Ok(Value::Integer(2)));
}

#[test]
fn test_state_rules_with_composite_and_unknown_targets() {
    let engine = FormulaEngine::new(EngineConfig::default());
    let count = engine
        .load_state_rules(
            "# first match wins\nRUNNING = False\nBOGUS = True\nSTATE = VAR('code')\nON = True",
        )
        .unwrap();
    assert_eq!(count, 4);

    engine.set_variable("code", Some(Value::Integer(DevState::Moving.code())));
    assert_eq!(engine.tick_state(), DevState::Moving);

    // listed states are left to their own rules
    engine.set_variable("code", Some(Value::Integer(DevState::Running.code())));
    assert_eq!(engine.tick_state(), DevState::On);
}

#[test]
fn test_quality_rules_substitute_captured_name() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine
        .load_quality_rules("Ok_* = ALARM if not ATTR('Flag_$') else VALID")
        .unwrap();
    engine
        .load_attributes("Flag_Pump = VAR('flag')\nOk_Pump = 1")
        .unwrap();

    engine.set_variable("flag", Some(Value::Boolean(false)));
    engine.read("Ok_Pump").unwrap();
    assert_eq!(
        engine.attribute_value("Ok_Pump").unwrap().quality,
        AttrQuality::Alarm
    );

    engine.set_variable("flag", Some(Value::Boolean(true)));
    engine.read("Ok_Pump").unwrap();
    assert_eq!(
        engine.attribute_value("Ok_Pump").unwrap().quality,
        AttrQuality::Valid
    );
}

#[test]
fn test_status_lines() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.load_attributes("Temp = 21").unwrap();
    let lines = engine.load_status("'Temp is ' + str(Temp)\n\n1 / 0\nstr(STATE)");
    assert_eq!(lines, 3);
    assert_eq!(engine.status(), "Temp is 21\nUNKNOWN");
}

#[test]
fn test_configured_attribute_settings_apply_on_definition() {
    let config = EngineConfig::from_str(
        r#"{
            "keep": ["A"],
            "attributes": { "b": { "ttl": 250, "abs_change": 1.5, "notify": false } }
        }"#,
    )
    .unwrap();
    let engine = FormulaEngine::new(config);
    engine.load_attributes("A = 1\nB = 2").unwrap();

    assert!(engine.is_kept("a"));
    let b = engine.definition("B").unwrap();
    assert_eq!(b.ttl, Some(Duration::from_millis(250)));
    assert!(!b.notify);
    assert_eq!(b.thresholds.absolute, 1.5);
    assert_eq!(engine.effective_ttl("B"), Some(Duration::from_millis(250)));
}
