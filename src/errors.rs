//! Error types for the device lifecycle core.
//!
//! Three layers:
//! - [`RigError`]: construction, I/O, configuration and persistence failures.
//! - [`BackendError`]: what a capture backend reports from probe/open/read.
//! - [`TransitionFailure`]: the descriptor every registry operation returns when
//!   a request is refused. It carries a stable machine code for the protocol.

use crate::types::Lifecycle;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Device went away or did not answer in time. Retrying may help.
    Unreachable,
    /// The device answered but with something unusable.
    Misconfigured,
    /// The handle is dead; the device needs a reset or re-plug.
    Fatal,
    /// The backend does not implement the operation.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Misconfigured,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Unsupported,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == BackendErrorKind::Fatal
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            BackendErrorKind::Unreachable => "unreachable",
            BackendErrorKind::Misconfigured => "misconfigured",
            BackendErrorKind::Fatal => "fatal",
            BackendErrorKind::Unsupported => "unsupported",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::TimedOut => {
                BackendError::unreachable(err.to_string())
            }
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput => {
                BackendError::misconfigured(err.to_string())
            }
            _ => BackendError::fatal(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidTransition,
    NotFound,
    Busy,
    Unavailable,
    Closed,
}

/// Why a registry request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TransitionFailure {
    pub fn invalid_transition(from: Lifecycle, action: &str) -> Self {
        Self {
            kind: FailureKind::InvalidTransition,
            message: format!("cannot {} while {}", action, from.as_str()),
        }
    }

    pub fn not_found(stable_id: &str) -> Self {
        Self {
            kind: FailureKind::NotFound,
            message: format!("device not found: {}", stable_id),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Busy,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn closed() -> Self {
        Self {
            kind: FailureKind::Closed,
            message: "device registry is shut down".to_string(),
        }
    }

    /// Stable code carried in `error` status messages.
    pub fn code(&self) -> &'static str {
        match self.kind {
            FailureKind::InvalidTransition => "invalid_transition",
            FailureKind::NotFound => "device_not_found",
            FailureKind::Busy => "busy",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Closed => "shutting_down",
        }
    }
}

impl fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransitionFailure {}
