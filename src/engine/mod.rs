//! The attribute engine.
//!
//! Attributes are declared as `NAME=FORMULA`, compiled once by [`compiler`], and evaluated
//! by [`engine::FormulaEngine`] on demand: cached values are served inside their TTL,
//! dependencies found by [`dependency`] are refreshed first, results get a quality from
//! [`quality`] and are checked by [`change`] before observers are notified. State rules
//! live in [`state`].

pub mod change;
pub mod compiler;
pub mod declaration;
pub mod dependency;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod error;
pub mod helpers;
pub mod names;
pub mod quality;
pub mod state;
pub mod store;

pub use change::ChangeThresholds;
pub use engine::{AccessMode, AttributeDefinition, EvaluationStats, FormulaEngine};
pub use error::{FormulaError, FormulaResult};
pub use helpers::{DeviceProxy, ProxyError};
pub use names::NameKey;
pub use store::AttributeValue;
