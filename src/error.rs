use thiserror::Error;

use crate::codec::CodecError;
use crate::eval::evaluator::EvalError;
use crate::parser::ParseError;
use crate::validate::ValidationError;

#[derive(Error, Debug)]
pub enum Error {
    // parse error
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    // eval error
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    /// The evaluation error behind this error, if any.
    pub fn as_eval(&self) -> Option<&EvalError> {
        match self {
            Error::Eval(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.as_eval().is_some_and(EvalError::is_interrupt)
    }
}
