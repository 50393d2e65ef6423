use serde::{Deserialize, Serialize};

use super::error::FormulaError;
use crate::eval::Value;

/// Notification thresholds for one attribute. Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeThresholds {
    #[serde(default)]
    pub absolute: f64,
    /// Percentage of the previous value.
    #[serde(default)]
    pub relative: f64,
}

impl ChangeThresholds {
    pub fn new(absolute: f64, relative: f64) -> Self {
        Self { absolute, relative }
    }

    pub fn absolute(absolute: f64) -> Self {
        Self::new(absolute, 0.0)
    }

    pub fn relative(relative: f64) -> Self {
        Self::new(0.0, relative)
    }

    pub fn is_configured(&self) -> bool {
        self.absolute > 0.0 || self.relative > 0.0
    }
}

/// Decides whether `new` differs enough from `previous` to notify observers.
pub fn changed(previous: Option<&Value>, new: &Value, thresholds: &ChangeThresholds) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let (old, new) = (previous.inner(), new.inner());

    // collections are compared as a whole
    if old.is_collection() || new.is_collection() || !thresholds.is_configured() {
        return old != new;
    }

    match (old.to_f64(), new.to_f64()) {
        (Some(o), Some(n)) => {
            if thresholds.absolute > 0.0 && (n - o).abs() > thresholds.absolute {
                return true;
            }
            if thresholds.relative > 0.0 {
                let a = o * (1.0 - thresholds.relative / 100.0);
                let b = o * (1.0 + thresholds.relative / 100.0);
                if n < a.min(b) || n > a.max(b) {
                    return true;
                }
            }
            false
        }
        _ => old != new,
    }
}

/// Change check over stored outcomes, where either side may be an error.
pub fn outcome_changed(
    previous: Option<&Result<Value, FormulaError>>,
    new: &Result<Value, FormulaError>,
    thresholds: &ChangeThresholds,
) -> bool {
    match (previous, new) {
        (None, _) => true,
        (Some(Ok(old)), Ok(new)) => changed(Some(old), new, thresholds),
        (Some(Err(old)), Err(new)) => old != new,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalError;
    use proptest::prelude::*;

    #[test]
    fn test_first_value_is_a_change() {
        assert!(changed(None, &Value::Integer(1), &ChangeThresholds::default()));
    }

    #[test]
    fn test_absolute_threshold() {
        let t = ChangeThresholds::absolute(2.0);
        let old = Value::Integer(10);
        assert!(!changed(Some(&old), &Value::Integer(11), &t));
        assert!(!changed(Some(&old), &Value::Integer(12), &t));
        assert!(changed(Some(&old), &Value::Integer(13), &t));
        assert!(changed(Some(&old), &Value::Float(7.5), &t));
    }

    #[test]
    fn test_relative_threshold() {
        let t = ChangeThresholds::relative(10.0);
        let old = Value::Integer(100);
        assert!(!changed(Some(&old), &Value::Integer(109), &t));
        assert!(changed(Some(&old), &Value::Integer(111), &t));
        assert!(changed(Some(&old), &Value::Integer(89), &t));

        // band of a negative value
        let old = Value::Float(-100.0);
        assert!(!changed(Some(&old), &Value::Float(-105.0), &t));
        assert!(changed(Some(&old), &Value::Float(-115.0), &t));
    }

    #[test]
    fn test_without_thresholds_any_difference_counts() {
        let t = ChangeThresholds::default();
        assert!(!changed(Some(&Value::Integer(1)), &Value::Integer(1), &t));
        assert!(changed(Some(&Value::Integer(1)), &Value::Integer(2), &t));
        assert!(changed(Some(&Value::from("a")), &Value::from("b"), &t));
    }

    #[test]
    fn test_non_numeric_falls_back_to_inequality() {
        let t = ChangeThresholds::absolute(5.0);
        assert!(changed(Some(&Value::from("on")), &Value::from("off"), &t));
        assert!(!changed(Some(&Value::from("on")), &Value::from("on"), &t));
    }

    #[test]
    fn test_collections_use_raw_inequality() {
        let old = Value::from(vec![1i64, 2, 3]);
        let close = Value::from(vec![1i64, 2, 4]);
        for t in [ChangeThresholds::default(), ChangeThresholds::absolute(10.0)] {
            assert!(changed(Some(&old), &close, &t));
            assert!(!changed(Some(&old), &old.clone(), &t));
        }
    }

    #[test]
    fn test_outcome_transitions() {
        let t = ChangeThresholds::absolute(1.0);
        let err = Err(FormulaError::Evaluation {
            name: "A".to_string(),
            source: EvalError::DivisionByZero,
        });
        let ok: Result<Value, FormulaError> = Ok(Value::Integer(1));
        assert!(outcome_changed(Some(&ok), &err, &t));
        assert!(outcome_changed(Some(&err), &ok, &t));
        assert!(!outcome_changed(Some(&err), &err.clone(), &t));
        assert!(!outcome_changed(Some(&ok), &Ok(Value::Float(1.5)), &t));
    }

    proptest! {
        #[test]
        fn prop_within_absolute_band_is_unchanged(old in -1e6f64..1e6, delta in -1.0f64..1.0) {
            let t = ChangeThresholds::absolute(1.0);
            prop_assert!(!changed(Some(&Value::Float(old)), &Value::Float(old + delta * 0.999), &t));
        }

        #[test]
        fn prop_beyond_absolute_band_is_changed(old in -1e6f64..1e6, delta in 1.01f64..1e3) {
            let t = ChangeThresholds::absolute(1.0);
            prop_assert!(changed(Some(&Value::Float(old)), &Value::Float(old + delta), &t));
            prop_assert!(changed(Some(&Value::Float(old)), &Value::Float(old - delta), &t));
        }

        #[test]
        fn prop_identical_values_never_change(x in any::<i64>(), abs in 0.0f64..10.0, rel in 0.0f64..50.0) {
            let t = ChangeThresholds::new(abs, rel);
            prop_assert!(!changed(Some(&Value::Integer(x)), &Value::Integer(x), &t));
        }
    }
}
