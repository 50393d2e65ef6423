//! # Whitespace Token Handling
//!
//! Whitespace is preserved as tokens so spans stay exact; the tokenizer filters it out
//! before parsing (see [`super::token::Tokenizer::tokenize`]). Formulas are single logical
//! expressions, so newlines count as ordinary whitespace.

use nom::{bytes::complete::take_while1, combinator::map, error::context};

use super::token::{ParserResult, Token};

/// Parses a run of spaces, tabs and line breaks.
///
/// ```
/// # use dynattr::tokenizer::whitespace::parse_whitespace;
/// # use dynattr::tokenizer::token::Token;
/// let (rest, token) = parse_whitespace(" \t x").unwrap();
/// assert_eq!(token, Token::Whitespace(" \t ".to_string()));
/// assert_eq!(rest, "x");
/// ```
#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_whitespace(input: &str) -> ParserResult<Token> {
    context(
        "whitespace expected",
        map(
            take_while1(|c| c == ' ' || c == '\t' || c == '\n' || c == '\r'),
            |ws: &str| Token::Whitespace(ws.to_string()),
        ),
    )(input)
}
