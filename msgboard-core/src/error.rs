use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the board core.
///
/// None of these are fatal: a failed store operation leaves the collection
/// untouched, and a failed session only affects its own observer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoardError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Message not found: {0}")]
    NotFound(String),
    #[error("Session {0} overflowed its delivery queue")]
    Overflow(Uuid),
    #[error("Session is closed")]
    SessionClosed,
    #[error("Timed out waiting for an event")]
    Timeout,
}

/// Transport-neutral error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Overflow,
    SessionClosed,
    Timeout,
}

impl BoardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::SessionClosed => ErrorKind::SessionClosed,
            Self::Timeout => ErrorKind::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BoardError::InvalidInput("x".into()).kind(), ErrorKind::InvalidInput);
        assert_eq!(BoardError::NotFound("9".into()).kind(), ErrorKind::NotFound);
        assert_eq!(BoardError::Overflow(Uuid::nil()).kind(), ErrorKind::Overflow);
        assert_eq!(BoardError::SessionClosed.kind(), ErrorKind::SessionClosed);
        assert_eq!(BoardError::Timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_error_display() {
        let err = BoardError::NotFound("42".into());
        assert_eq!(err.to_string(), "Message not found: 42");
    }
}
