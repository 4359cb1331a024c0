use thiserror::Error;

pub type BsonResult<T> = Result<T, BsonError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BsonError {
    #[error("Document already finished")]
    AlreadyFinished,

    #[error("Document not finished")]
    NotFinished,

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Embedded NUL byte in {0}")]
    InteriorNul(&'static str),

    #[error("Nesting depth {0} exceeds the configured maximum")]
    NestingTooDeep(usize),

    #[error("{0} nested object(s) left open")]
    UnclosedNesting(usize),

    #[error("No nested object is open")]
    NotNested,

    #[error("Document size {0} exceeds the maximum document size")]
    SizeOverflow(usize),

    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Invalid object id: {0}")]
    InvalidOid(String),

    #[error("Fatal codec error: {0}")]
    Fatal(String),
}
