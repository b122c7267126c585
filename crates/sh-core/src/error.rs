use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The interpreter raised a parse or runtime error.
    Engine,
    /// Exclusive access to the engine could not be acquired.
    Concurrency,
    /// Programming error: lease misuse, conflicting setup, stopped worker.
    State,
    /// The task was cancelled before it started running.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Error, Clone)]
#[error("{code}: {message}")]
pub struct HostError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub position: Option<SourcePosition>,
}

impl HostError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            position: None,
        }
    }

    pub fn engine(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Engine, code, message)
    }

    pub fn concurrency(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Concurrency, code, message)
    }

    pub fn state(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, code, message)
    }

    pub fn cancelled(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, code, message)
    }

    pub fn with_position(mut self, position: Option<SourcePosition>) -> Self {
        self.position = position;
        self
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn display_joins_code_and_message() {
        let error = HostError::state("ENGINE_LEASE_RELEASED", "lease already released");
        assert_eq!(error.to_string(), "ENGINE_LEASE_RELEASED: lease already released");
        assert!(error.is(ErrorKind::State));
        assert!(error.position.is_none());
    }

    #[test]
    fn constructors_assign_kinds() {
        assert_eq!(HostError::engine("E", "m").kind, ErrorKind::Engine);
        assert_eq!(HostError::concurrency("C", "m").kind, ErrorKind::Concurrency);
        assert_eq!(HostError::cancelled("X", "m").kind, ErrorKind::Cancelled);

        let positioned = HostError::engine("E", "m")
            .with_position(Some(SourcePosition { line: 2, column: 7 }));
        assert_eq!(
            positioned.position,
            Some(SourcePosition { line: 2, column: 7 })
        );
    }

    #[test]
    fn kind_serializes_camel_case() {
        let raw = serde_json::to_string(&ErrorKind::Concurrency).expect("kind json");
        assert_eq!(raw, "\"concurrency\"");
    }
}
