use nom::{
    branch::alt,
    character::complete::{char, digit0, digit1, one_of, satisfy},
    combinator::{map, map_res, opt, recognize, value},
    error::context,
    multi::fold_many0,
    sequence::{delimited, preceded, tuple},
};

use super::token::{ParserResult, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
}

fn parse_escape(input: &str) -> ParserResult<char> {
    preceded(
        char('\\'),
        alt((
            value('\n', char('n')),
            value('\t', char('t')),
            value('\\', char('\\')),
            value('\'', char('\'')),
            value('"', char('"')),
        )),
    )(input)
}

fn parse_quoted(quote: char) -> impl Fn(&str) -> ParserResult<String> {
    move |input| {
        delimited(
            char(quote),
            fold_many0(
                alt((parse_escape, satisfy(move |c| c != quote && c != '\\'))),
                String::new,
                |mut acc, c| {
                    acc.push(c);
                    acc
                },
            ),
            char(quote),
        )(input)
    }
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_string_literal(input: &str) -> ParserResult<Literal> {
    context(
        "string literal",
        map(alt((parse_quoted('"'), parse_quoted('\''))), Literal::String),
    )(input)
}

fn parse_exponent(input: &str) -> ParserResult<&str> {
    recognize(tuple((one_of("eE"), opt(one_of("+-")), digit1)))(input)
}

// Signs are left to the expression parser so that `X-1` stays three tokens.
#[tracing::instrument(level = "trace", skip(input))]
fn parse_float_literal(input: &str) -> ParserResult<Literal> {
    context(
        "float literal",
        map_res(
            alt((
                recognize(tuple((digit1, char('.'), digit0, opt(parse_exponent)))),
                recognize(tuple((digit1, parse_exponent))),
            )),
            |s: &str| s.parse::<f64>().map(Literal::Float),
        ),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_integer_literal(input: &str) -> ParserResult<Literal> {
    context(
        "integer literal",
        map_res(digit1, |s: &str| s.parse::<i64>().map(Literal::Integer)),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_literal(input: &str) -> ParserResult<Token> {
    context(
        "literal",
        map(
            alt((
                parse_string_literal,
                parse_float_literal,
                parse_integer_literal,
            )),
            Token::Literal,
        ),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_and_single_quoted_strings() {
        let (rest, result) = parse_string_literal("\"hello world\"").unwrap();
        assert_eq!(rest, "");
        assert_eq!(result, Literal::String("hello world".to_string()));

        let (rest, result) = parse_string_literal("'T_1' rest").unwrap();
        assert_eq!(rest, " rest");
        assert_eq!(result, Literal::String("T_1".to_string()));
    }

    #[test]
    fn test_escapes() {
        let (_, result) = parse_string_literal(r#""a\"b\n""#).unwrap();
        assert_eq!(result, Literal::String("a\"b\n".to_string()));

        let (_, result) = parse_string_literal(r"'it\'s'").unwrap();
        assert_eq!(result, Literal::String("it's".to_string()));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(parse_string_literal("\"open").is_err());
    }

    #[test]
    fn test_number_literals() {
        let (rest, result) = parse_integer_literal("123").unwrap();
        assert_eq!(result, Literal::Integer(123));
        assert_eq!(rest, "");

        let (rest, result) = parse_float_literal("123.45").unwrap();
        assert_eq!(result, Literal::Float(123.45));
        assert_eq!(rest, "");

        let (_, result) = parse_float_literal("1e3").unwrap();
        assert_eq!(result, Literal::Float(1000.0));

        let (_, result) = parse_float_literal("2.").unwrap();
        assert_eq!(result, Literal::Float(2.0));
    }

    #[test]
    fn test_literal_prefers_float() {
        let (rest, token) = parse_literal("3.5*2").unwrap();
        assert_eq!(token, Token::Literal(Literal::Float(3.5)));
        assert_eq!(rest, "*2");
    }

    #[test]
    fn test_no_sign_in_literal() {
        assert!(parse_literal("-1").is_err());
    }
}
