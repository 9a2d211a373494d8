//! Error types for session actions.

use std::fmt::{Display, Formatter};

/// Errors that can occur while handling a session action.
///
/// Everything except `Infrastructure` is caller error: it is reported only to
/// the originating connection and never mutates state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A non-coordinator invoked a coordinator-only action (or vice versa).
    Authorization { message: String },
    /// The code does not resolve to a live session.
    NotFound { message: String },
    /// The action is invalid for the session's current state.
    State { message: String },
    /// Malformed payload or out-of-range vote.
    Validation { message: String },
    /// Identity or connection already bound to a different live session.
    Conflict { message: String },
    /// Storage layer failure. Detail is for logs only.
    Infrastructure { message: String },
}

impl SessionError {
    pub fn not_found() -> Self {
        Self::NotFound {
            message: "Session not found".to_string(),
        }
    }

    pub fn not_in_session() -> Self {
        Self::NotFound {
            message: "Not in a session".to_string(),
        }
    }

    pub fn coordinator_only() -> Self {
        Self::Authorization {
            message: "Only the coordinator can do that".to_string(),
        }
    }

    /// Wraps a storage failure, keeping the full cause chain for logging.
    pub fn infrastructure(err: anyhow::Error) -> Self {
        Self::Infrastructure {
            message: format!("{:#}", err),
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }

    /// Message safe to show to the caller.
    pub fn user_message(&self) -> String {
        match self {
            Self::Authorization { message }
            | Self::NotFound { message }
            | Self::State { message }
            | Self::Validation { message }
            | Self::Conflict { message } => message.clone(),
            Self::Infrastructure { .. } => "Server error".to_string(),
        }
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authorization { message } => write!(f, "not authorized: {}", message),
            Self::NotFound { message } => write!(f, "not found: {}", message),
            Self::State { message } => write!(f, "invalid state: {}", message),
            Self::Validation { message } => write!(f, "invalid input: {}", message),
            Self::Conflict { message } => write!(f, "conflict: {}", message),
            Self::Infrastructure { message } => write!(f, "storage failure: {}", message),
        }
    }
}

impl std::error::Error for SessionError {}
