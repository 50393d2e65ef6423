//! Abstract syntax tree for formulas.
//!
//! A formula is a single expression. The tree is produced once by
//! [`crate::analyzer::parsers::parse_formula`] and then walked by the
//! [`crate::eval::expression::ExpressionEvaluator`] on every evaluation.

use std::collections::BTreeSet;
use std::fmt;

use crate::engine::names::NameKey;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    Variable(String),
    List(Vec<Expression>),
    FunctionCall {
        function: String,
        arguments: Vec<Expression>,
    },
    Index {
        target: Box<Expression>,
        index: Box<Expression>,
    },
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    // `then if condition else otherwise`
    Conditional {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BinaryOperator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Subtract,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,
    #[strum(serialize = "//")]
    FloorDivide,
    #[strum(serialize = "%")]
    Modulo,
    #[strum(serialize = "**")]
    Power,
    #[strum(serialize = "==")]
    Equal,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "<")]
    LessThan,
    #[strum(serialize = ">")]
    GreaterThan,
    #[strum(serialize = "<=")]
    LessThanEqual,
    #[strum(serialize = ">=")]
    GreaterThanEqual,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum UnaryOperator {
    #[strum(serialize = "-")]
    Negate,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "not")]
    Not,
}

impl Expression {
    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOperator, operand: Expression) -> Self {
        Expression::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    /// Every identifier read as a variable anywhere in the tree. Function names are not
    /// included.
    pub fn variables(&self) -> BTreeSet<NameKey> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut BTreeSet<NameKey>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Variable(name) => {
                names.insert(NameKey::new(name));
            }
            Expression::List(items) => items.iter().for_each(|e| e.collect_variables(names)),
            Expression::FunctionCall { arguments, .. } => {
                arguments.iter().for_each(|e| e.collect_variables(names))
            }
            Expression::Index { target, index } => {
                target.collect_variables(names);
                index.collect_variables(names);
            }
            Expression::BinaryOp { left, right, .. } => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
            Expression::UnaryOp { operand, .. } => operand.collect_variables(names),
            Expression::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_variables(names);
                then.collect_variables(names);
                otherwise.collect_variables(names);
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(Literal::Integer(i)) => write!(f, "{}", i),
            Expression::Literal(Literal::Float(x)) => write!(f, "{:?}", x),
            Expression::Literal(Literal::String(s)) => write!(f, "{:?}", s),
            Expression::Literal(Literal::Boolean(true)) => write!(f, "True"),
            Expression::Literal(Literal::Boolean(false)) => write!(f, "False"),
            Expression::Literal(Literal::Null) => write!(f, "None"),
            Expression::Variable(name) => write!(f, "{}", name),
            Expression::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expression::FunctionCall {
                function,
                arguments,
            } => {
                write!(f, "{}(", function)?;
                for (i, arg) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expression::Index { target, index } => write!(f, "{}[{}]", target, index),
            Expression::BinaryOp { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expression::UnaryOp {
                op: UnaryOperator::Not,
                operand,
            } => write!(f, "(not {})", operand),
            Expression::UnaryOp { op, operand } => write!(f, "({}{})", op, operand),
            Expression::Conditional {
                condition,
                then,
                otherwise,
            } => write!(f, "({} if {} else {})", then, condition, otherwise),
        }
    }
}
