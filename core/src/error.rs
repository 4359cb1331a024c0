use crate::bson::BsonError;
use crate::notation::NotationError;
use thiserror::Error;

pub type DocWireResult<T> = Result<T, DocWireError>;

/// Broad classification of a failure, used by callers that only care
/// whether the wire, the document, or the server is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    Transport,
    Validity,
    Server,
}

#[derive(Error, Debug)]
pub enum DocWireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("Reply size out of range: {0} bytes")]
    ReadSize(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Document error: {0}")]
    Bson(#[from] BsonError),

    #[error("Notation error: {0}")]
    Notation(#[from] NotationError),

    #[error("Document is not finished")]
    NotFinished,

    #[error("Document too large: {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Host {0} is not primary")]
    NotPrimary(String),

    #[error("No primary found for replica set {0}")]
    NoPrimary(String),

    #[error("Replica set name mismatch: expected {expected}, found {found}")]
    BadSetName { expected: String, found: String },

    #[error("Cursor is no longer usable")]
    CursorInvalid,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Chunk {n} missing for file {files_id}")]
    ChunkMissing { files_id: String, n: u64 },
}

impl DocWireError {
    pub fn domain(&self) -> ErrorDomain {
        match self {
            DocWireError::Io(_)
            | DocWireError::Connection(_)
            | DocWireError::ConnectionClosed
            | DocWireError::NotConnected
            | DocWireError::Timeout
            | DocWireError::ReadSize(_)
            | DocWireError::Protocol(_) => ErrorDomain::Transport,

            DocWireError::Bson(_)
            | DocWireError::Notation(_)
            | DocWireError::NotFinished
            | DocWireError::TooLarge { .. }
            | DocWireError::InvalidDocument(_)
            | DocWireError::InvalidNamespace(_)
            | DocWireError::InvalidInput(_)
            | DocWireError::CursorInvalid => ErrorDomain::Validity,

            DocWireError::Server { .. }
            | DocWireError::CommandFailed(_)
            | DocWireError::QueryFailed(_)
            | DocWireError::AuthFailed(_)
            | DocWireError::NotPrimary(_)
            | DocWireError::NoPrimary(_)
            | DocWireError::BadSetName { .. }
            | DocWireError::FileNotFound(_)
            | DocWireError::ChunkMissing { .. } => ErrorDomain::Server,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.domain() == ErrorDomain::Transport
    }

    /// Maps socket errors onto the transport variants the client reports.
    pub fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => DocWireError::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => DocWireError::ConnectionClosed,
            _ => DocWireError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domains() {
        assert_eq!(DocWireError::Timeout.domain(), ErrorDomain::Transport);
        assert_eq!(DocWireError::NotFinished.domain(), ErrorDomain::Validity);
        assert_eq!(
            DocWireError::BadSetName {
                expected: "rs0".into(),
                found: "rs1".into()
            }
            .domain(),
            ErrorDomain::Server
        );
        assert!(DocWireError::from(BsonError::AlreadyFinished).domain() == ErrorDomain::Validity);
    }

    #[test]
    fn test_io_mapping() {
        let e = DocWireError::from_io(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(matches!(e, DocWireError::Timeout));
        let e = DocWireError::from_io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(matches!(e, DocWireError::ConnectionClosed));
        assert!(e.is_transport());
    }
}
