//! Error types

use crate::protocol::ErrorFields;
use std::io;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the socket, or it was already closed when an operation started
    #[error("connection closed")]
    ConnectionClosed,

    /// A read or write did not complete within the operation's timeout
    #[error("operation timed out")]
    Timeout,

    /// Malformed bytes on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed message the current operation phase cannot accept
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// ErrorResponse reported by the backend
    #[error("server error: {0}")]
    Server(ErrorFields),

    /// More than one stage of a multi-stage operation failed
    #[error("{} stages failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    /// TLS engine failure
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Encryption was mandatory but the backend declined the SSLRequest
    #[error("server does not support TLS")]
    TlsRejected,

    /// Authentication failed or is unsupported
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid connection state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state description
        expected: String,
        /// Actual state description
        actual: String,
    },

    /// A buffer would have to grow past the largest ladder rung
    #[error("buffer limit exceeded: {0} bytes requested")]
    BufferLimit(usize),

    /// The pool was closed while a caller waited on it
    #[error("pool closed")]
    PoolClosed,
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Whether the connection that produced this error must be torn down.
    ///
    /// Server errors are reported after the session is back at ReadyForQuery, so the
    /// connection stays usable; everything else leaves the stream in an unknown state.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Server(_) => false,
            Error::Aggregate(errors) => errors.iter().any(Error::is_fatal),
            _ => true,
        }
    }

    /// SQLSTATE code of a server error, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    /// Collapse stage errors: none is success, one is surfaced as-is, more become an aggregate.
    pub fn from_stages(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(code: &str, message: &str) -> Error {
        Error::Server(ErrorFields {
            severity: Some("ERROR".into()),
            code: Some(code.into()),
            message: Some(message.into()),
            ..ErrorFields::default()
        })
    }

    #[test]
    fn test_single_stage_error_is_unwrapped() {
        let err = Error::from_stages(vec![server("42P01", "missing table")]).unwrap();
        assert_eq!(err.sqlstate(), Some("42P01"));
    }

    #[test]
    fn test_multiple_stage_errors_aggregate() {
        let err = Error::from_stages(vec![
            server("42P01", "missing table"),
            server("22012", "division by zero"),
        ])
        .unwrap();
        match &err {
            Error::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
        let text = err.to_string();
        assert!(text.starts_with("2 stages failed"));
        assert!(text.contains("missing table"));
        assert!(text.contains("division by zero"));
    }

    #[test]
    fn test_no_stage_errors() {
        assert!(Error::from_stages(Vec::new()).is_none());
    }

    #[test]
    fn test_fatality() {
        assert!(!server("23505", "dup").is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::Aggregate(vec![server("1", "a"), Error::Timeout]).is_fatal());
    }
}
