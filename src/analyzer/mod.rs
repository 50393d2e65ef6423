//! # Formula Analyzer
//!
//! Parser combinators over the token stream produced by [`crate::tokenizer`]. The
//! combinators in [`combinators`] are generic over the input item type; [`parsers`]
//! instantiates them for [`crate::tokenizer::Token`] and builds the formula grammar.

pub mod combinators;
pub mod core;
pub mod parsers;
pub mod prelude;

pub use core::ParseError;
pub use core::ParseResult;
pub use core::Parser;
pub use parsers::parse_formula;
