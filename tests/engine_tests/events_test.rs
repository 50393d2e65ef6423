use std::sync::Arc;
use std::time::Duration;

use dynattr::event_bus::Event;
use dynattr::refresher::TaskStatus;
use dynattr::{
    AttrQuality, BackgroundTask, DevState, EngineConfig, FormulaEngine, Refresher, RefresherConfig,
    Value,
};
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_changes_are_published() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.define("Level", "VAR('level')");
    let (mut events, _errors) = engine.subscribe();

    engine.set_variable("level", Some(Value::Integer(3)));
    engine.read("Level").unwrap();
    engine.read("Level").unwrap();
    engine.set_variable("level", Some(Value::Integer(4)));
    engine.read("Level").unwrap();

    for expected in [3, 4] {
        match events.recv().await.unwrap() {
            Event::AttributeChanged {
                name,
                value,
                quality,
                ..
            } => {
                assert_eq!(name, "Level");
                assert_eq!(value, Ok(Value::Integer(expected)));
                assert_eq!(quality, AttrQuality::Valid);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_failures_are_published_on_error_channel() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.define("Ratio", "1 / VAR('d')");
    let (mut events, mut errors) = engine.subscribe();

    engine.set_variable("d", Some(Value::Integer(0)));
    assert!(engine.read("Ratio").is_err());

    let error = errors.recv().await.unwrap();
    assert_eq!(error.name, "Ratio");
    assert!(error.message.contains("Ratio"));

    // the stored error itself is a change
    match events.recv().await.unwrap() {
        Event::AttributeChanged { value, quality, .. } => {
            assert!(value.is_err());
            assert_eq!(quality, AttrQuality::Invalid);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_notify_can_be_disabled_per_attribute() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.define("Quiet", "VAR('q')");
    engine.set_notify("Quiet", false);
    let (mut events, _errors) = engine.subscribe();

    engine.set_variable("q", Some(Value::Integer(1)));
    engine.read("Quiet").unwrap();
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_state_transition_is_published() {
    let engine = FormulaEngine::new(EngineConfig::default());
    engine.add_state_rule("FAULT", "VAR('broken')");
    let (mut events, _errors) = engine.subscribe();

    engine.set_variable("broken", Some(Value::Boolean(true)));
    engine.tick_state();
    engine.tick_state();

    assert_eq!(
        events.recv().await.unwrap(),
        Event::StateChanged {
            previous: DevState::Unknown,
            current: DevState::Fault,
        }
    );
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_refresher_keeps_values_current() {
    let engine = Arc::new(FormulaEngine::new(EngineConfig::default()));
    engine
        .load_attributes("Counter = VAR('n', (VAR('n') or 0) + 1)\nHigh = Counter > 2")
        .unwrap();
    engine.set_keep("Counter", true);
    engine.add_state_rule("ALARM", "VAR('n') > 2");

    let config = RefresherConfig {
        cycle_period: Duration::from_millis(5),
        ..RefresherConfig::default()
    };
    let refresher = Arc::new(Refresher::new(engine.clone(), config));
    let handle = refresher.clone().spawn();

    timeout(Duration::from_secs(5), async {
        while engine.state() != DevState::Alarm {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state rules were ticked");

    refresher.stop().await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(refresher.status().await, TaskStatus::Inactive);
    assert!(engine.stats("Counter").unwrap().evaluations >= 3);
    assert_eq!(engine.stats("High").unwrap().evaluations, 0);
}
