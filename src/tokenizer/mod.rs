//! # Formula Tokenizer
//!
//! Lexical analysis of formula text with nom. The tokenizer produces [`token::TokenSpan`]s
//! that the [`crate::analyzer`] turns into an AST and that the dependency extractor
//! scans for attribute references.

pub mod keyword;
pub mod literal;
pub mod symbol;
pub mod token;
pub mod whitespace;

pub use token::{tokenize_formula, Token, TokenSpan, Tokenizer, TokenizerError};
