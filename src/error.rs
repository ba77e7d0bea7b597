use thiserror::Error;

use crate::filter::FilterField;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("authentication failed, check username, password and auth source: {0}")]
    Authentication(String),

    #[error("could not reach the server, verify host and port: {0}")]
    Unreachable(String),

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("failed to connect: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("currentOp failed: {0}")]
    Command(String),

    #[error("malformed operation record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminateError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("killOp rejected for {id}: {reason}")]
    Rejected { id: String, reason: String },

    #[error("killOp type mismatch for {id}: {reason}")]
    TypeMismatch { id: String, reason: String },

    #[error("operation {0} not found")]
    NotFound(String),

    #[error("invalid operation id '{0}'")]
    InvalidId(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterConfigError {
    #[error("{field} expects a whole number of seconds, got '{value}'")]
    InvalidNumber { field: FilterField, value: String },

    #[error("{field} does not accept '{value}': {reason}")]
    InvalidText {
        field: FilterField,
        value: String,
        reason: String,
    },
}

impl FetchError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

impl TerminateError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}
