use std::collections::HashMap;
use std::time::Duration;

use super::error::FormulaError;
use super::names::NameKey;
use crate::eval::{AttrQuality, Value};
use crate::timestamp::Timestamp;

/// Last known outcome of an attribute, value or error.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    pub value: Result<Value, FormulaError>,
    pub quality: AttrQuality,
    /// When the value was produced, or the time the value itself carried.
    pub timestamp: Timestamp,
    /// When the formula last ran. Drives TTL freshness.
    pub evaluated_at: Timestamp,
    pub last_read: Option<Timestamp>,
    pub last_retry: Option<Timestamp>,
    /// Set by a write. The value is kept for comparison but no longer served.
    pub expired: bool,
}

impl AttributeValue {
    pub fn success(value: Value, quality: AttrQuality, timestamp: Timestamp, now: Timestamp) -> Self {
        Self {
            value: Ok(value),
            quality,
            timestamp,
            evaluated_at: now,
            last_read: None,
            last_retry: None,
            expired: false,
        }
    }

    pub fn failure(error: FormulaError, now: Timestamp) -> Self {
        Self {
            value: Err(error),
            quality: AttrQuality::Invalid,
            timestamp: now,
            evaluated_at: now,
            last_read: None,
            last_retry: Some(now),
            expired: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.value.is_err()
    }

    /// Errors are never fresh: the next access re-attempts.
    pub fn is_fresh(&self, ttl: Duration, now: Timestamp) -> bool {
        self.value.is_ok()
            && !self.expired
            && !ttl.is_zero()
            && now.since(&self.evaluated_at) < ttl
    }
}

/// Per-context storage of attribute values.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: HashMap<NameKey, AttributeValue>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &NameKey) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    /// Stores a new outcome, keeping the read bookkeeping of the previous one.
    pub fn put(&mut self, name: NameKey, mut value: AttributeValue) -> Option<AttributeValue> {
        if let Some(previous) = self.values.get(&name) {
            value.last_read = value.last_read.or(previous.last_read);
            if value.last_retry.is_none() {
                value.last_retry = previous.last_retry;
            }
        }
        self.values.insert(name, value)
    }

    pub fn touch(&mut self, name: &NameKey, now: Timestamp) {
        if let Some(value) = self.values.get_mut(name) {
            value.last_read = Some(now);
        }
    }

    pub fn fresh(&self, name: &NameKey, ttl: Duration, now: Timestamp) -> Option<&AttributeValue> {
        self.values.get(name).filter(|v| v.is_fresh(ttl, now))
    }

    /// Forces the next read to recompute while keeping the value as the baseline for
    /// change detection.
    pub fn expire(&mut self, name: &NameKey) {
        if let Some(value) = self.values.get_mut(name) {
            value.expired = true;
        }
    }

    pub fn invalidate(&mut self, name: &NameKey) -> Option<AttributeValue> {
        self.values.remove(name)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
