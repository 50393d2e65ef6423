//! # dynattr: Formula-Driven Attributes
//!
//! dynattr computes named values ("attributes") from declarative formula text. An
//! attribute may depend on other attributes, is cached with a time-to-live, gets a
//! quality tag, and notifies observers when it changes beyond a threshold. Ordered state
//! rules derive one device state from the attributes.
//!
//! ## Formula Pipeline
//!
//! ```text
//! Formula Text → Tokenizer → Analyzer → AST → Compiled Formula → Evaluator
//! ```
//!
//! - [`tokenizer`]: nom lexer producing spanned tokens
//! - [`analyzer`]: parser combinators building the [`ast`]
//! - [`engine::compiler`]: compiles each formula once; broken formulas fail when first
//!   evaluated
//! - [`eval`]: sandboxed interpreter. Formulas only see what the [`eval::Environment`]
//!   binds plus a fixed set of builtins
//!
//! ## Engine
//!
//! [`FormulaEngine`] owns every registry of one context behind a single reentrant lock:
//! definitions, the value store, state and quality rules, overrides and scratch
//! variables. Hosts embed it as a field and drive it through explicit calls:
//!
//! ```no_run
//! use dynattr::{EngineConfig, FormulaEngine, Value};
//!
//! let engine = FormulaEngine::new(EngineConfig::default());
//! engine.load_attributes("A = 3 * 2\nB = A + 1").unwrap();
//! assert_eq!(engine.read("B").unwrap(), Value::Integer(7));
//! ```
//!
//! ## Background Work and Events
//!
//! The [`refresher`] walks kept attributes periodically and ticks the state rules.
//! Changes and state transitions are published on the [`event_bus`].

pub mod analyzer;
pub mod ast;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod event_bus;
pub mod refresher;
pub mod timestamp;
pub mod tokenizer;

// Re-exports
pub use config::{AttributeConfig, EngineConfig, RefresherConfig};
pub use engine::{
    AccessMode, AttributeValue, ChangeThresholds, DeviceProxy, FormulaEngine, FormulaError,
    FormulaResult, NameKey, ProxyError,
};
pub use error::*;
pub use eval::{AttrQuality, DevState, EvalError, Value};
pub use event_bus::{Event, EventBus};
pub use refresher::{BackgroundTask, Refresher};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};
