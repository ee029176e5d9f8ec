use thiserror::Error;

use crate::ast::{Position, Stmt};

// パーサートレイト

/// Source text to statement tree. The grammar lives outside this crate; hosts
/// plug a parser into [`Engine::with_parser`](crate::engine::Engine::with_parser).
#[mockall::automock]
pub trait Parser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Vec<Stmt>, ParseError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} at {position}")]
pub struct ParseError {
    pub message: String,
    pub position: Position,
}

impl ParseError {
    pub fn new<S: Into<String>>(message: S, position: Position) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}
