use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{
    context::ExecutionContext,
    function::Frame,
    scope::Scope,
    statement::{ControlFlow, StatementResult},
    value::Value,
};
use crate::ast::{Position, Stmt};

pub type EvalResult<T> = Result<T, EvalError>;

#[derive(Error, Debug, Clone)]
pub enum EvalError {
    #[error("undefined symbol '{name}'")]
    UndefinedSymbol { name: String },
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("index out of range: index {index} with length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("index must be a number, got {found}")]
    IndexNotNumber { found: String },
    #[error("invalid slice index: {start} > {end}")]
    InvalidSliceIndex { start: i64, end: i64 },
    #[error("function {name} wants {expected} arguments but received {received}")]
    ArgumentCount {
        name: String,
        expected: String,
        received: usize,
    },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("{0}")]
    Thrown(Value),
    #[error("execution interrupted")]
    Interrupt,
    #[error("scope limit exceeded: more than {limit} live scopes")]
    ScopeLimit { limit: usize },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{error} at {position}")]
    Positioned {
        position: Position,
        error: Box<EvalError>,
    },
}

impl EvalError {
    pub fn type_mismatch(expected: &str, found: &str) -> Self {
        EvalError::TypeMismatch {
            message: format!("wants type {} but received type {}", expected, found),
        }
    }

    /// The error without its position wrapper
    pub fn root(&self) -> &EvalError {
        match self {
            EvalError::Positioned { error, .. } => error.root(),
            other => other,
        }
    }

    pub fn position(&self) -> Option<Position> {
        match self {
            EvalError::Positioned { position, .. } => Some(*position),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self.root(), EvalError::Interrupt)
    }

    /// Governor failures that signal an unsafe script or configuration
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), EvalError::ScopeLimit { .. })
    }

    /// Whether `try`/`catch` may intercept the error
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self.root(),
            EvalError::Interrupt | EvalError::ScopeLimit { .. } | EvalError::Internal(_)
        )
    }

    /// Attach a source position. The innermost position wins; interrupts and
    /// fatal errors stay bare.
    pub fn at(self, position: Position) -> Self {
        if !position.is_known() || !self.is_catchable() {
            return self;
        }
        match self {
            positioned @ EvalError::Positioned { .. } => positioned,
            error => EvalError::Positioned {
                position,
                error: Box::new(error),
            },
        }
    }

    /// Script-visible value of a caught error: a thrown value as-is, anything else as its message.
    pub fn to_value(&self) -> Value {
        match self.root() {
            EvalError::Thrown(value) => value.clone(),
            other => Value::String(other.to_string()),
        }
    }
}

/// Tree-walking evaluator for one run.
///
/// Cloning is cheap and shares the execution context, so spawned tasks and
/// host callbacks observe the same cancellation signal and cycle counter.
#[derive(Debug, Clone)]
pub struct Evaluator {
    pub(crate) ctx: Arc<ExecutionContext>,
}

impl Evaluator {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Top level entry point: evaluate `statements` directly in `scope`.
    ///
    /// Top-level definitions persist in `scope`. A top-level `return` ends the
    /// run with its value; otherwise the result is the last statement's value.
    pub async fn run(&self, statements: &[Stmt], scope: &Arc<Scope>) -> EvalResult<Value> {
        let frame = Frame::default();
        let result = self.eval_block(statements, scope, &frame).await;
        let result = self.run_defers(&frame, result).await;
        debug!(
            run_id = %self.ctx.run_id(),
            cycles = self.ctx.cycles(),
            "evaluation finished"
        );
        match result? {
            StatementResult::Value(value) => Ok(value),
            StatementResult::Control(ControlFlow::Return(value)) => Ok(value),
            StatementResult::Control(flow) => Err(EvalError::InvalidOperation(format!(
                "{} outside of a loop",
                flow
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_innermost_wins() {
        let err = EvalError::UndefinedSymbol {
            name: "x".to_string(),
        }
        .at(Position::new(3, 4))
        .at(Position::new(1, 1));
        assert_eq!(err.position(), Some(Position::new(3, 4)));
        assert_eq!(err.to_string(), "undefined symbol 'x' at 3:4");
    }

    #[test]
    fn test_interrupt_is_never_positioned_or_catchable() {
        let err = EvalError::Interrupt.at(Position::new(2, 2));
        assert!(err.position().is_none());
        assert!(err.is_interrupt());
        assert!(!err.is_catchable());
        assert!(!EvalError::ScopeLimit { limit: 1 }.is_catchable());
        assert!(EvalError::ScopeLimit { limit: 1 }.is_fatal());
    }

    #[test]
    fn test_to_value() {
        let thrown = EvalError::Thrown(Value::Int(7)).at(Position::new(1, 2));
        assert_eq!(thrown.to_value(), Value::Int(7));
        let err = EvalError::InvalidOperation("boom".to_string());
        assert_eq!(err.to_value(), Value::string("invalid operation: boom"));
    }
}
