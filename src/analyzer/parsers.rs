//! Formula grammar, lowest precedence first:
//!
//! ```text
//! expression     := logical_or ["if" logical_or "else" expression]
//! logical_or     := logical_and ("or" logical_and)*
//! logical_and    := logical_not ("and" logical_not)*
//! logical_not    := "not"* comparison
//! comparison     := additive (comp_op additive)*
//! additive       := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/" | "//" | "%") unary)*
//! unary          := ("-" | "+")* power
//! power          := postfix ["**" unary]
//! postfix        := primary ("[" expression "]")*
//! primary        := call | literal | list | identifier | "(" expression ")"
//! ```
//!
//! Chained comparisons (`a < b < c`) become a conjunction of pairwise comparisons.

use super::core::*;
use super::prelude::*;
use crate::ast::{BinaryOperator, Expression, Literal, UnaryOperator};
use crate::tokenizer::{
    keyword::Keyword,
    literal::Literal as TokenLiteral,
    symbol::{Delimiter, Operator},
    token::Token,
};

/// Parses a whole formula. Every token must be consumed.
#[tracing::instrument(level = "debug", skip(tokens))]
pub fn parse_formula(tokens: &[Token]) -> Result<Expression, ParseError> {
    let (pos, expression) = parse_expression().parse(tokens, 0)?;
    if pos < tokens.len() {
        return Err(ParseError::ParseError {
            message: "unexpected token".to_string(),
            found: tokens[pos].to_string(),
            position: (pos, pos + 1),
        });
    }
    Ok(expression)
}

pub fn parse_expression() -> impl Parser<Token, Expression> {
    with_context(lazy(boxed_conditional), "expression")
}

// Boxing breaks the recursive `impl Parser` cycles for the trait solver.
fn boxed_conditional() -> Box<dyn Parser<Token, Expression>> {
    Box::new(parse_conditional())
}

fn boxed_unary() -> Box<dyn Parser<Token, Expression>> {
    Box::new(parse_unary())
}

fn parse_conditional() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_logical_or(),
                optional(tuple2(
                    preceded(parse_keyword(Keyword::If), parse_logical_or()),
                    preceded(parse_keyword(Keyword::Else), lazy(parse_expression)),
                )),
            ),
            |(then, branch)| match branch {
                Some((condition, otherwise)) => Expression::Conditional {
                    condition: Box::new(condition),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                },
                None => then,
            },
        ),
        "conditional",
    )
}

fn parse_logical_or() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_logical_and(),
                many(tuple2(
                    map(parse_keyword(Keyword::Or), |_| BinaryOperator::Or),
                    parse_logical_and(),
                )),
            ),
            |(first, rest)| fold_binary(first, rest),
        ),
        "logical or",
    )
}

fn parse_logical_and() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_logical_not(),
                many(tuple2(
                    map(parse_keyword(Keyword::And), |_| BinaryOperator::And),
                    parse_logical_not(),
                )),
            ),
            |(first, rest)| fold_binary(first, rest),
        ),
        "logical and",
    )
}

fn parse_logical_not() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(many(parse_keyword(Keyword::Not)), parse_comparison()),
            |(nots, operand)| {
                nots.into_iter()
                    .fold(operand, |acc, _| Expression::unary(UnaryOperator::Not, acc))
            },
        ),
        "logical not",
    )
}

fn parse_comparison() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_additive(),
                many(tuple2(parse_comparison_operator(), parse_additive())),
            ),
            |(first, rest)| chain_comparisons(first, rest),
        ),
        "comparison",
    )
}

fn parse_additive() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_multiplicative(),
                many(tuple2(
                    parse_operator_of(vec![
                        (Operator::Plus, BinaryOperator::Add),
                        (Operator::Minus, BinaryOperator::Subtract),
                    ]),
                    parse_multiplicative(),
                )),
            ),
            |(first, rest)| fold_binary(first, rest),
        ),
        "additive",
    )
}

fn parse_multiplicative() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                lazy(boxed_unary),
                many(tuple2(
                    parse_operator_of(vec![
                        (Operator::Multiply, BinaryOperator::Multiply),
                        (Operator::Divide, BinaryOperator::Divide),
                        (Operator::FloorDivide, BinaryOperator::FloorDivide),
                        (Operator::Modulo, BinaryOperator::Modulo),
                    ]),
                    lazy(boxed_unary),
                )),
            ),
            |(first, rest)| fold_binary(first, rest),
        ),
        "multiplicative",
    )
}

fn parse_unary() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                many(satisfy(|token: &Token| match token {
                    Token::Operator(Operator::Minus) => Some(UnaryOperator::Negate),
                    Token::Operator(Operator::Plus) => Some(UnaryOperator::Plus),
                    _ => None,
                })),
                parse_power(),
            ),
            |(ops, operand)| {
                ops.into_iter()
                    .rev()
                    .fold(operand, |acc, op| Expression::unary(op, acc))
            },
        ),
        "unary",
    )
}

// `**` binds tighter than a unary minus on its left and is right associative.
fn parse_power() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_postfix(),
                optional(preceded(
                    equal(Token::Operator(Operator::Power)),
                    lazy(boxed_unary),
                )),
            ),
            |(base, exponent)| match exponent {
                Some(exponent) => Expression::binary(BinaryOperator::Power, base, exponent),
                None => base,
            },
        ),
        "power",
    )
}

fn parse_postfix() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                parse_primary(),
                many(delimited(
                    as_unit(parse_delimiter(Delimiter::OpenBracket)),
                    lazy(parse_expression),
                    as_unit(parse_delimiter(Delimiter::CloseBracket)),
                )),
            ),
            |(target, indexes)| {
                indexes
                    .into_iter()
                    .fold(target, |acc, index| Expression::Index {
                        target: Box::new(acc),
                        index: Box::new(index),
                    })
            },
        ),
        "postfix",
    )
}

fn parse_primary() -> impl Parser<Token, Expression> {
    with_context(
        choice(vec![
            Box::new(parse_function_call()),
            Box::new(map(parse_literal(), Expression::Literal)),
            Box::new(parse_list()),
            Box::new(map(parse_identifier(), Expression::Variable)),
            Box::new(parse_parenthesized()),
        ]),
        "primary",
    )
}

fn parse_function_call() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(parse_identifier(), parse_arguments()),
            |(function, arguments)| Expression::FunctionCall {
                function,
                arguments,
            },
        ),
        "function call",
    )
}

fn parse_arguments() -> impl Parser<Token, Vec<Expression>> {
    with_context(
        delimited(
            as_unit(parse_delimiter(Delimiter::OpenParen)),
            separated_list(
                lazy(parse_expression),
                as_unit(parse_delimiter(Delimiter::Comma)),
            ),
            as_unit(parse_delimiter(Delimiter::CloseParen)),
        ),
        "arguments",
    )
}

fn parse_list() -> impl Parser<Token, Expression> {
    with_context(
        map(
            delimited(
                as_unit(parse_delimiter(Delimiter::OpenBracket)),
                separated_list(
                    lazy(parse_expression),
                    as_unit(parse_delimiter(Delimiter::Comma)),
                ),
                as_unit(parse_delimiter(Delimiter::CloseBracket)),
            ),
            Expression::List,
        ),
        "list",
    )
}

fn parse_parenthesized() -> impl Parser<Token, Expression> {
    with_context(
        delimited(
            as_unit(parse_delimiter(Delimiter::OpenParen)),
            lazy(parse_expression),
            as_unit(parse_delimiter(Delimiter::CloseParen)),
        ),
        "parenthesized",
    )
}

fn parse_comparison_operator() -> impl Parser<Token, BinaryOperator> {
    choice(vec![
        Box::new(parse_operator_of(vec![
            (Operator::EqualEqual, BinaryOperator::Equal),
            (Operator::NotEqual, BinaryOperator::NotEqual),
            (Operator::LessEqual, BinaryOperator::LessThanEqual),
            (Operator::GreaterEqual, BinaryOperator::GreaterThanEqual),
            (Operator::Less, BinaryOperator::LessThan),
            (Operator::Greater, BinaryOperator::GreaterThan),
        ])),
        Box::new(map(parse_keyword(Keyword::In), |_| BinaryOperator::In)),
        Box::new(map(
            tuple2(parse_keyword(Keyword::Not), parse_keyword(Keyword::In)),
            |_| BinaryOperator::NotIn,
        )),
    ])
}

pub fn parse_identifier() -> impl Parser<Token, String> {
    with_context(
        satisfy(|token: &Token| match token {
            Token::Identifier(s) => Some(s.clone()),
            _ => None,
        }),
        "identifier",
    )
}

pub fn parse_literal() -> impl Parser<Token, Literal> {
    with_context(
        satisfy(|token: &Token| match token {
            Token::Literal(TokenLiteral::Integer(i)) => Some(Literal::Integer(*i)),
            Token::Literal(TokenLiteral::Float(f)) => Some(Literal::Float(*f)),
            Token::Literal(TokenLiteral::String(s)) => Some(Literal::String(s.clone())),
            Token::Literal(TokenLiteral::Boolean(b)) => Some(Literal::Boolean(*b)),
            Token::Literal(TokenLiteral::Null) => Some(Literal::Null),
            _ => None,
        }),
        "literal",
    )
}

fn parse_keyword(keyword: Keyword) -> impl Parser<Token, Token> {
    equal(Token::Keyword(keyword))
}

fn parse_delimiter(delimiter: Delimiter) -> impl Parser<Token, Token> {
    equal(Token::Delimiter(delimiter))
}

fn parse_operator_of(
    table: Vec<(Operator, BinaryOperator)>,
) -> impl Parser<Token, BinaryOperator> {
    satisfy(move |token: &Token| match token {
        Token::Operator(op) => table
            .iter()
            .find(|(candidate, _)| candidate == op)
            .map(|(_, binary)| *binary),
        _ => None,
    })
}

fn fold_binary(first: Expression, rest: Vec<(BinaryOperator, Expression)>) -> Expression {
    rest.into_iter()
        .fold(first, |left, (op, right)| Expression::binary(op, left, right))
}

fn chain_comparisons(first: Expression, rest: Vec<(BinaryOperator, Expression)>) -> Expression {
    let mut left = first;
    let mut pairs = Vec::with_capacity(rest.len());
    for (op, right) in rest {
        pairs.push(Expression::binary(op, left, right.clone()));
        left = right;
    }
    let mut pairs = pairs.into_iter();
    match pairs.next() {
        Some(head) => pairs.fold(head, |acc, next| {
            Expression::binary(BinaryOperator::And, acc, next)
        }),
        None => left,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tokenize_formula;

    fn parse(input: &str) -> Expression {
        let tokens: Vec<Token> = tokenize_formula(input)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect();
        parse_formula(&tokens).unwrap()
    }

    fn parse_err(input: &str) -> ParseError {
        let tokens: Vec<Token> = tokenize_formula(input)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect();
        parse_formula(&tokens).unwrap_err()
    }

    #[test]
    fn test_precedence() {
        assert_eq!(parse("1 + 2 * 3").to_string(), "(1 + (2 * 3))");
        assert_eq!(parse("(1 + 2) * 3").to_string(), "((1 + 2) * 3)");
        assert_eq!(parse("A - B - C").to_string(), "((A - B) - C)");
        assert_eq!(parse("X-1").to_string(), "(X - 1)");
    }

    #[test]
    fn test_power_and_unary() {
        assert_eq!(parse("-2 ** 2").to_string(), "(-(2 ** 2))");
        assert_eq!(parse("2 ** 3 ** 2").to_string(), "(2 ** (3 ** 2))");
        assert_eq!(parse("2 ** -1").to_string(), "(2 ** (-1))");
        assert_eq!(parse("--A").to_string(), "(-(-A))");
    }

    #[test]
    fn test_logical_operators() {
        assert_eq!(
            parse("a or b and not c").to_string(),
            "(a or (b and (not c)))"
        );
        assert_eq!(parse("not A > 1").to_string(), "(not (A > 1))");
    }

    #[test]
    fn test_conditional() {
        assert_eq!(
            parse("ALARM if VALUE>10 else VALID").to_string(),
            "(ALARM if (VALUE > 10) else VALID)"
        );
        assert_eq!(
            parse("1 if a else 2 if b else 3").to_string(),
            "(1 if a else (2 if b else 3))"
        );
    }

    #[test]
    fn test_chained_comparison() {
        assert_eq!(
            parse("0 < X <= 10").to_string(),
            "((0 < X) and (X <= 10))"
        );
    }

    #[test]
    fn test_membership() {
        assert_eq!(parse("STATE in [ON, OFF]").to_string(), "(STATE in [ON, OFF])");
        assert_eq!(parse("x not in y").to_string(), "(x not in y)");
    }

    #[test]
    fn test_calls_and_indexing() {
        let expr = parse("XATTR('sys/tg/1/ampli', 0)[1]");
        assert_eq!(expr.to_string(), "XATTR(\"sys/tg/1/ampli\", 0)[1]");

        assert_eq!(parse("max(A, B, 3)").to_string(), "max(A, B, 3)");
        assert_eq!(parse("now()").to_string(), "now()");
        assert_eq!(parse("[1, 2.5, 'x'][0]").to_string(), "[1, 2.5, \"x\"][0]");
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            parse("None"),
            Expression::Literal(Literal::Null)
        );
        assert_eq!(
            parse("True"),
            Expression::Literal(Literal::Boolean(true))
        );
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        match parse_err("A B") {
            ParseError::ParseError {
                found, position, ..
            } => {
                assert_eq!(found, "B");
                assert_eq!(position, (1, 2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_expression() {
        assert!(parse_formula(&[]).is_err());
        let err = parse_err("1 +");
        assert!(matches!(err, ParseError::ParseError { ref found, .. } if found == "+"));
        // nothing matches at the open paren, so the failure comes from the primary alternatives
        assert_eq!(parse_err("(1 + 2").root(), &ParseError::NoAlternative);
    }
}
