use std::cmp::Ordering;

use tracing::trace;

use super::builtins;
use super::context::Environment;
use super::value::Value;
use super::{EvalError, EvalResult};
use crate::ast::{BinaryOperator, Expression, Literal, UnaryOperator};

/// Tree-walking interpreter with Python-like semantics for arithmetic, truthiness and
/// the `and`/`or` operators (which return one of their operands).
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn eval_expression(&self, expr: &Expression, env: &dyn Environment) -> EvalResult<Value> {
        match expr {
            Expression::Literal(lit) => Ok(Self::eval_literal(lit)),
            Expression::Variable(name) => env.lookup(name),
            Expression::List(items) => items
                .iter()
                .map(|item| self.eval_expression(item, env))
                .collect::<EvalResult<Vec<_>>>()
                .map(Value::List),
            Expression::FunctionCall {
                function,
                arguments,
            } => self.eval_function_call(function, arguments, env),
            Expression::Index { target, index } => {
                let target = self.eval_expression(target, env)?;
                let index = self.eval_expression(index, env)?;
                Self::eval_index(&target, &index)
            }
            Expression::BinaryOp { op, left, right } => self.eval_binary_op(op, left, right, env),
            Expression::UnaryOp { op, operand } => {
                let operand = self.eval_expression(operand, env)?;
                Self::eval_unary_op(op, &operand)
            }
            Expression::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if self.eval_expression(condition, env)?.is_truthy() {
                    self.eval_expression(then, env)
                } else {
                    self.eval_expression(otherwise, env)
                }
            }
        }
    }

    fn eval_literal(lit: &Literal) -> Value {
        match lit {
            Literal::Integer(i) => Value::Integer(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::String(s.clone()),
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Null => Value::Null,
        }
    }

    fn eval_function_call(
        &self,
        function: &str,
        arguments: &[Expression],
        env: &dyn Environment,
    ) -> EvalResult<Value> {
        let args = arguments
            .iter()
            .map(|arg| self.eval_expression(arg, env))
            .collect::<EvalResult<Vec<_>>>()?;
        trace!("call {}({} args)", function, args.len());

        if let Some(result) = env.call(function, &args) {
            return result;
        }
        builtins::call_builtin(function, &args, env)
            .unwrap_or_else(|| Err(EvalError::UnknownFunction(function.to_string())))
    }

    fn eval_binary_op(
        &self,
        op: &BinaryOperator,
        left: &Expression,
        right: &Expression,
        env: &dyn Environment,
    ) -> EvalResult<Value> {
        let left_val = self.eval_expression(left, env)?;

        // short circuit, returning the deciding operand
        match op {
            BinaryOperator::And if !left_val.is_truthy() => return Ok(left_val),
            BinaryOperator::Or if left_val.is_truthy() => return Ok(left_val),
            _ => {}
        }

        let right_val = self.eval_expression(right, env)?;
        self.apply_binary_op(op, left_val, right_val)
    }

    pub fn apply_binary_op(
        &self,
        op: &BinaryOperator,
        left: Value,
        right: Value,
    ) -> EvalResult<Value> {
        let (l, r) = (left.inner(), right.inner());
        match op {
            BinaryOperator::And => Ok(if l.is_truthy() { right } else { left }),
            BinaryOperator::Or => Ok(if l.is_truthy() { left } else { right }),
            BinaryOperator::Add => self.eval_add(l, r),
            BinaryOperator::Subtract => {
                self.eval_arithmetic(op, l, r, i64::checked_sub, |a, b| a - b)
            }
            BinaryOperator::Multiply => self.eval_multiply(l, r),
            BinaryOperator::Divide => self.eval_divide(l, r),
            BinaryOperator::FloorDivide => self.eval_floor_divide(l, r),
            BinaryOperator::Modulo => self.eval_modulo(l, r),
            BinaryOperator::Power => self.eval_power(l, r),
            BinaryOperator::Equal => Ok(Value::Boolean(l.loose_eq(r))),
            BinaryOperator::NotEqual => Ok(Value::Boolean(!l.loose_eq(r))),
            BinaryOperator::LessThan => self.eval_compare(op, l, r, |o| o == Ordering::Less),
            BinaryOperator::GreaterThan => {
                self.eval_compare(op, l, r, |o| o == Ordering::Greater)
            }
            BinaryOperator::LessThanEqual => {
                self.eval_compare(op, l, r, |o| o != Ordering::Greater)
            }
            BinaryOperator::GreaterThanEqual => {
                self.eval_compare(op, l, r, |o| o != Ordering::Less)
            }
            BinaryOperator::In => self.eval_contains(l, r).map(Value::Boolean),
            BinaryOperator::NotIn => self.eval_contains(l, r).map(|found| Value::Boolean(!found)),
        }
    }

    fn unsupported(op: &BinaryOperator, left: &Value, right: &Value) -> EvalError {
        EvalError::UnsupportedOperands {
            op: op.to_string(),
            left: left.type_name(),
            right: right.type_name(),
        }
    }

    fn eval_arithmetic(
        &self,
        op: &BinaryOperator,
        left: &Value,
        right: &Value,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> EvalResult<Value> {
        if let (Some(l), Some(r)) = (left.as_integer(), right.as_integer()) {
            // overflow falls back to float instead of failing
            return Ok(match int_op(l, r) {
                Some(v) => Value::Integer(v),
                None => Value::Float(float_op(l as f64, r as f64)),
            });
        }
        match (left.as_number(), right.as_number()) {
            (Some(l), Some(r)) => Ok(Value::Float(float_op(l, r))),
            _ => Err(Self::unsupported(op, left, right)),
        }
    }

    fn eval_add(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(l.clone() + r)),
            (Value::List(l), Value::List(r)) => {
                Ok(Value::List(l.iter().chain(r.iter()).cloned().collect()))
            }
            _ => self.eval_arithmetic(&BinaryOperator::Add, left, right, i64::checked_add, |a, b| {
                a + b
            }),
        }
    }

    fn eval_multiply(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        match (left, right) {
            (Value::String(s), Value::Integer(n)) | (Value::Integer(n), Value::String(s)) => {
                let count = repeat_count(s.len(), *n)?;
                Ok(Value::String(s.repeat(count)))
            }
            (Value::List(items), Value::Integer(n)) | (Value::Integer(n), Value::List(items)) => {
                let count = repeat_count(items.len(), *n)?;
                let mut repeated = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    repeated.extend(items.iter().cloned());
                }
                Ok(Value::List(repeated))
            }
            _ => self.eval_arithmetic(
                &BinaryOperator::Multiply,
                left,
                right,
                i64::checked_mul,
                |a, b| a * b,
            ),
        }
    }

    fn numeric_pair(
        op: &BinaryOperator,
        left: &Value,
        right: &Value,
    ) -> EvalResult<(f64, f64)> {
        match (left.as_number(), right.as_number()) {
            (Some(l), Some(r)) => {
                if r == 0.0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok((l, r))
                }
            }
            _ => Err(Self::unsupported(op, left, right)),
        }
    }

    // true division always yields a float
    fn eval_divide(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        let (l, r) = Self::numeric_pair(&BinaryOperator::Divide, left, right)?;
        Ok(Value::Float(l / r))
    }

    fn eval_floor_divide(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        let (lf, rf) = Self::numeric_pair(&BinaryOperator::FloorDivide, left, right)?;
        match (left.as_integer(), right.as_integer()) {
            (Some(l), Some(r)) => match l.checked_div(r) {
                Some(quotient) if l % r != 0 && ((l < 0) != (r < 0)) => {
                    Ok(Value::Integer(quotient - 1))
                }
                Some(quotient) => Ok(Value::Integer(quotient)),
                // i64::MIN // -1
                None => Ok(Value::Float((lf / rf).floor())),
            },
            _ => Ok(Value::Float((lf / rf).floor())),
        }
    }

    // result takes the sign of the divisor
    fn eval_modulo(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        let (lf, rf) = Self::numeric_pair(&BinaryOperator::Modulo, left, right)?;
        match (left.as_integer(), right.as_integer()) {
            (Some(l), Some(r)) => {
                let m = l.wrapping_rem(r);
                // opposite signs, so the sum stays in range
                if m != 0 && ((m < 0) != (r < 0)) {
                    Ok(Value::Integer(m + r))
                } else {
                    Ok(Value::Integer(m))
                }
            }
            _ => Ok(Value::Float(lf - rf * (lf / rf).floor())),
        }
    }

    fn eval_power(&self, left: &Value, right: &Value) -> EvalResult<Value> {
        if let (Some(base), Some(exp)) = (left.as_integer(), right.as_integer()) {
            if let Ok(exp) = u32::try_from(exp) {
                if let Some(v) = base.checked_pow(exp) {
                    return Ok(Value::Integer(v));
                }
            }
        }
        match (left.as_number(), right.as_number()) {
            (Some(l), Some(r)) if l == 0.0 && r < 0.0 => Err(EvalError::DivisionByZero),
            (Some(l), Some(r)) => Ok(Value::Float(l.powf(r))),
            _ => Err(Self::unsupported(&BinaryOperator::Power, left, right)),
        }
    }

    fn eval_compare(
        &self,
        op: &BinaryOperator,
        left: &Value,
        right: &Value,
        accept: fn(Ordering) -> bool,
    ) -> EvalResult<Value> {
        left.loose_cmp(right)
            .map(|ordering| Value::Boolean(accept(ordering)))
            .ok_or_else(|| Self::unsupported(op, left, right))
    }

    fn eval_contains(&self, item: &Value, container: &Value) -> EvalResult<bool> {
        match (item, container) {
            (_, Value::List(items)) => Ok(items.iter().any(|candidate| candidate.loose_eq(item))),
            (Value::String(needle), Value::String(haystack)) => {
                Ok(haystack.contains(needle.as_str()))
            }
            _ => Err(EvalError::Type(format!(
                "argument of type '{}' is not iterable",
                container.type_name()
            ))),
        }
    }

    fn eval_unary_op(op: &UnaryOperator, operand: &Value) -> EvalResult<Value> {
        let inner = operand.inner();
        match op {
            UnaryOperator::Not => Ok(Value::Boolean(!inner.is_truthy())),
            UnaryOperator::Negate => match inner {
                Value::Float(f) => Ok(Value::Float(-f)),
                other => match other.as_integer() {
                    Some(i) => Ok(i
                        .checked_neg()
                        .map(Value::Integer)
                        .unwrap_or(Value::Float(-(i as f64)))),
                    None => Err(EvalError::Type(format!(
                        "bad operand type for unary -: '{}'",
                        other.type_name()
                    ))),
                },
            },
            UnaryOperator::Plus => match inner {
                Value::Float(f) => Ok(Value::Float(*f)),
                other => other.as_integer().map(Value::Integer).ok_or_else(|| {
                    EvalError::Type(format!(
                        "bad operand type for unary +: '{}'",
                        other.type_name()
                    ))
                }),
            },
        }
    }

    fn eval_index(target: &Value, index: &Value) -> EvalResult<Value> {
        let position = index.as_integer().ok_or_else(|| {
                EvalError::Type(format!(
                    "indices must be integers, not {}",
                    index.type_name()
                ))
            })?;

        let resolve = |len: usize| -> EvalResult<usize> {
            let len = len as i64;
            let resolved = if position < 0 { len + position } else { position };
            if resolved < 0 || resolved >= len {
                Err(EvalError::Index(format!(
                    "index {} out of range for length {}",
                    position, len
                )))
            } else {
                Ok(resolved as usize)
            }
        };

        match target.inner() {
            Value::List(items) => Ok(items[resolve(items.len())?].clone()),
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::String(chars[resolve(chars.len())?].to_string()))
            }
            other => Err(EvalError::Type(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }
}

/// Upper bound on the length of a string or list built by `*`.
pub const MAX_SEQUENCE_LEN: usize = 1 << 24;

fn repeat_count(len: usize, times: i64) -> EvalResult<usize> {
    let times = usize::try_from(times.max(0)).unwrap_or(usize::MAX);
    if len == 0 {
        return Ok(0);
    }
    match len.checked_mul(times) {
        Some(total) if total <= MAX_SEQUENCE_LEN => Ok(times),
        _ => Err(EvalError::Eval(format!(
            "repeated sequence exceeds {} elements",
            MAX_SEQUENCE_LEN
        ))),
    }
}
