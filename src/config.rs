use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};

use crate::engine::change::ChangeThresholds;
use crate::engine::names::NameKey;
use crate::eval::DevState;
use crate::{Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TTL of attributes without their own. Zero recomputes on every read unless the
    /// attribute is kept.
    #[serde(default, with = "duration_ms")]
    pub default_ttl: Duration,

    /// Attributes whose last value is cached across reads.
    #[serde(default)]
    pub keep: Vec<String>,

    #[serde(default)]
    pub attributes: HashMap<String, AttributeConfig>,

    #[serde(default = "default_true")]
    pub notify_changes: bool,

    /// How long a failed `XATTR`, `WATTR` or `COMMAND` call is not retried.
    #[serde(default = "default_external_retry_period", with = "duration_ms")]
    pub external_retry_period: Duration,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default)]
    pub refresher: RefresherConfig,

    #[serde(default)]
    pub initial_state: DevState,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::ZERO,
            keep: Vec::new(),
            attributes: HashMap::new(),
            notify_changes: default_true(),
            external_retry_period: default_external_retry_period(),
            event_buffer_size: default_event_buffer_size(),
            refresher: RefresherConfig::default(),
            initial_state: DevState::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> InternalResult<Self> {
        from_file(path)
    }

    pub fn from_str(s: &str) -> InternalResult<Self> {
        from_str(s)
    }

    /// Per-attribute settings, looked up case-insensitively.
    pub fn attribute(&self, name: &str) -> Option<&AttributeConfig> {
        let key = NameKey::new(name);
        self.attributes
            .iter()
            .find(|(configured, _)| key.matches(configured))
            .map(|(_, config)| config)
    }

    pub fn is_kept(&self, name: &str) -> bool {
        let key = NameKey::new(name);
        self.keep.iter().any(|k| key.matches(k)) || self.attribute(name).is_some_and(|a| a.keep)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeConfig {
    #[serde(default, with = "duration_ms_opt")]
    pub ttl: Option<Duration>,

    #[serde(default)]
    pub keep: bool,

    #[serde(default)]
    pub abs_change: f64,

    /// Percent.
    #[serde(default)]
    pub rel_change: f64,

    #[serde(default)]
    pub notify: Option<bool>,
}

impl AttributeConfig {
    pub fn thresholds(&self) -> ChangeThresholds {
        ChangeThresholds::new(self.abs_change, self.rel_change)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cycle_period", with = "duration_ms")]
    pub cycle_period: Duration,

    /// Pause between two attributes of one cycle.
    #[serde(default, with = "duration_ms")]
    pub attribute_delay: Duration,

    #[serde(default = "default_true")]
    pub tick_state: bool,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cycle_period: default_cycle_period(),
            attribute_delay: Duration::ZERO,
            tick_state: default_true(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_true() -> bool {
    true
}
fn default_external_retry_period() -> Duration {
    Duration::from_millis(3000)
}
fn default_event_buffer_size() -> usize {
    1000
}
fn default_cycle_period() -> Duration {
    Duration::from_millis(3000)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
