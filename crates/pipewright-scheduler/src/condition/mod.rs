//! Sandboxed evaluation of step conditions.
//!
//! A condition is a small boolean expression over the job variables, for
//! example `return $BRANCH == "main" && $COUNT > 2;`. Variables are looked up
//! by name with a leading `$` (or `${NAME}`); names with no value evaluate to
//! `null`. Evaluation runs on the blocking pool and is abandoned after the
//! configured timeout. Conditions cannot touch the file system, the network
//! or the process environment.

mod eval;
mod lexer;
mod parser;

use pipewright_core::Vars;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition timed out after {0:?}")]
    Timeout(Duration),

    #[error("condition must return a boolean, got {0}")]
    Type(String),

    #[error("condition failed: {0}")]
    Eval(String),

    #[error("invalid condition: {0}")]
    Parse(String),
}

/// Runtime value of a condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
        }
    }

    /// Numbers, and strings that parse as numbers.
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn to_text(&self) -> String {
        self.to_string()
    }

    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => self.to_text() == other.to_text(),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Check that `condition` parses, without evaluating it.
pub fn verify(condition: &str) -> Result<(), ConditionError> {
    let tokens = lexer::tokenize(condition)?;
    parser::parse(&tokens).map(|_| ())
}

/// Evaluates conditions with a wall-clock limit.
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    timeout: Duration,
}

impl ConditionEvaluator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Evaluate `condition` against `vars`. A missing or blank condition is
    /// true.
    pub async fn run(&self, condition: Option<&str>, vars: &Vars) -> Result<bool, ConditionError> {
        let Some(source) = condition.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(true);
        };

        let expr = parser::parse(&lexer::tokenize(source)?)?;
        let vars = vars.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let limit = self.timeout;

        let flag = cancelled.clone();
        let task = tokio::task::spawn_blocking(move || {
            eval::Evaluator::new(&vars, limit, &flag).eval(&expr)
        });

        let value = match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.map_err(|e| ConditionError::Eval(e.to_string()))??,
            Err(_) => {
                cancelled.store(true, Ordering::Relaxed);
                return Err(ConditionError::Timeout(self.timeout));
            }
        };

        debug!(condition = source, result = %value, "condition evaluated");
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(ConditionError::Type(other.type_name().to_string())),
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
