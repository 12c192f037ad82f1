use crate::model::CommandStatus;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Client,
    Command,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Command => "command",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by every relay operation.
///
/// `Conflict` and `NotFound` are expected outcomes of concurrent use and are
/// handed back to the caller; the relay never retries them on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("unknown client '{0}'")]
    UnknownClient(String),
    #[error("command '{command_id}' is {actual}, expected {expected}")]
    Conflict {
        command_id: String,
        expected: CommandStatus,
        actual: CommandStatus,
    },
    #[error("missing or invalid credential")]
    Unauthorized,
    #[error("store error: {0}")]
    Store(String),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn client_not_found(client_id: &str) -> Self {
        RelayError::NotFound {
            kind: EntityKind::Client,
            id: client_id.to_string(),
        }
    }

    pub fn command_not_found(command_id: &str) -> Self {
        RelayError::NotFound {
            kind: EntityKind::Command,
            id: command_id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RelayError::Conflict { .. })
    }

    /// Short machine-readable code used in wire error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation_error",
            RelayError::NotFound { .. } => "not_found",
            RelayError::UnknownClient(_) => "unknown_client",
            RelayError::Conflict { .. } => "conflict",
            RelayError::Unauthorized => "unauthorized",
            RelayError::Store(_) => "store_error",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
