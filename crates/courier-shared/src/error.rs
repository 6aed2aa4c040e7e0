use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the remote gatekeeper declined a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    PermissionDenied,
    Malformed,
    TooLarge,
    RateLimited,
}

impl RejectionKind {
    /// Only throttling can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Failure of a single call against the remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote server error: {0}")]
    Server(String),

    #[error("Interrupted by connectivity loss")]
    Interrupted,

    #[error("Rejected by remote ({kind:?}): {reason}")]
    Rejected { kind: RejectionKind, reason: String },
}

impl DeliveryError {
    pub fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self::Rejected {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether another attempt could succeed. Transient failures consume the
    /// retry budget; everything else fails the record immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) | Self::Server(_) | Self::Interrupted => true,
            Self::Rejected { kind, .. } => kind.is_retryable(),
        }
    }
}

/// Rejected input, caught locally before anything is written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message body is empty")]
    EmptyBody,

    #[error("Message body too large: {len} bytes (max {max})")]
    BodyTooLong { len: usize, max: usize },

    #[error("A conversation needs at least {min} distinct participants, got {got}")]
    TooFewParticipants { got: usize, min: usize },

    #[error("Sender is not a participant of the conversation")]
    NotParticipant,

    #[error("Unknown status value: {0}")]
    UnknownStatus(String),
}
