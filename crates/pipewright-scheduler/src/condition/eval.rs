//! Interpreter for parsed conditions.

use pipewright_core::Vars;
use regex::RegexBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::parser::{BinOp, Expr};
use super::{ConditionError, Value};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub(crate) struct Evaluator<'a> {
    vars: &'a Vars,
    deadline: Instant,
    limit: Duration,
    cancelled: &'a AtomicBool,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(vars: &'a Vars, limit: Duration, cancelled: &'a AtomicBool) -> Self {
        Self {
            vars,
            deadline: Instant::now() + limit,
            limit,
            cancelled,
        }
    }

    fn check(&self) -> Result<(), ConditionError> {
        if self.cancelled.load(Ordering::Relaxed) || Instant::now() >= self.deadline {
            return Err(ConditionError::Timeout(self.limit));
        }
        Ok(())
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value, ConditionError> {
        self.check()?;

        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Var(name) => Ok(self
                .vars
                .get(name)
                .map(|v| Value::Str(v.to_string()))
                .unwrap_or(Value::Null)),
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            Expr::Neg(operand) => {
                let value = self.eval(operand)?;
                let n = number(&value, "-")?;
                Ok(Value::Num(-n))
            }
            Expr::Binary(BinOp::And, left, right) => {
                if !self.eval(left)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.truthy()))
            }
            Expr::Binary(BinOp::Or, left, right) => {
                if self.eval(left)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.truthy()))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)
            }
        }
    }
}

fn number(value: &Value, op: &str) -> Result<f64, ConditionError> {
    value.as_number().ok_or_else(|| {
        ConditionError::Eval(format!("operator '{op}' needs a number, got {}", value.type_name()))
    })
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, ConditionError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(left.loose_eq(&right))),
        BinOp::Ne => Ok(Value::Bool(!left.loose_eq(&right))),
        BinOp::Match => {
            let Value::Str(pattern) = &right else {
                return Err(ConditionError::Eval(format!(
                    "'=~' needs a string pattern, got {}",
                    right.type_name()
                )));
            };
            let regex = RegexBuilder::new(pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| ConditionError::Eval(e.to_string()))?;
            Ok(Value::Bool(regex.is_match(&left.to_text())))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (&left, &right) {
                    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                    _ => {
                        return Err(ConditionError::Eval(format!(
                            "cannot compare {} with {}",
                            left.type_name(),
                            right.type_name()
                        )));
                    }
                },
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => match (&left, &right) {
            (Value::Str(a), Value::Str(b)) if left.as_number().is_none() || right.as_number().is_none() => {
                Ok(Value::Str(format!("{a}{b}")))
            }
            _ => Ok(Value::Num(number(&left, "+")? + number(&right, "+")?)),
        },
        BinOp::Sub => Ok(Value::Num(number(&left, "-")? - number(&right, "-")?)),
        BinOp::Mul => Ok(Value::Num(number(&left, "*")? * number(&right, "*")?)),
        BinOp::Div | BinOp::Rem => {
            let a = number(&left, "/")?;
            let b = number(&right, "/")?;
            if b == 0.0 {
                return Err(ConditionError::Eval("division by zero".to_string()));
            }
            Ok(Value::Num(if op == BinOp::Div { a / b } else { a % b }))
        }
        BinOp::And => Ok(Value::Bool(left.truthy() && right.truthy())),
        BinOp::Or => Ok(Value::Bool(left.truthy() || right.truthy())),
    }
}
