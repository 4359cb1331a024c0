use super::machine::State;
use super::token::TypeSpec;
use crate::bson::BsonError;
use thiserror::Error;

pub type NotationResult<T> = Result<T, NotationError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotationError {
    #[error("Token stream ended in state {state:?} with {depth} level(s) open")]
    DocumentIncomplete { state: State, depth: usize },

    #[error("Type marker {spec:?} cannot apply to the token at position {position}")]
    TypeSpec { spec: TypeSpec, position: usize },

    #[error("Unexpected token at position {position}: expected {expected}")]
    UnexpectedToken {
        position: usize,
        expected: &'static str,
    },

    #[error("Unbalanced closing token at position {0}")]
    Unbalanced(usize),

    #[error("Live value at position {0} is already mutably borrowed")]
    Borrowed(usize),

    #[error(transparent)]
    Bson(#[from] BsonError),
}
