//! Wire protocol for the voting server.
//!
//! One JSON object per line, tagged with `"type"`.

use crate::domain::{Identity, JoinCode, Role, SessionSnapshot};
use serde::{Deserialize, Serialize};

/// Git SHA of the running build, stamped by `build.rs`.
pub const BUILD_SHA: &str = env!("QUICKPOLL_GIT_SHA");

/// Messages sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Create a session and become its coordinator
    Start {
        #[serde(default)]
        identity: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Join {
        code: String,
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        identity: Option<String>,
    },
    /// Resume a previous role after the connection dropped
    Reconnect { identity: String, code: String },
    CloseDoors,
    #[serde(rename_all = "camelCase")]
    OpenVote {
        #[serde(default)]
        timer_seconds: Option<u64>,
    },
    CloseVote,
    /// `value` stays untyped so a non-integer is a validation error rather
    /// than an unparseable message
    CastVote { value: serde_json::Value },
    End,
    Ping,
}

/// Messages sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection
    Hello { version: String },
    Role { role: Role },
    SessionCode { code: JoinCode },
    AssignedIdentity { identity: Identity },
    /// `None` tells the client it has no session to show
    SessionState { snapshot: Option<SessionSnapshot> },
    VoteAcknowledged { value: u8 },
    SessionEnded,
    ReconnectFailed,
    ActionError { message: String },
    Pong,
}

impl ServerMessage {
    pub fn hello() -> Self {
        ServerMessage::Hello {
            version: BUILD_SHA.to_string(),
        }
    }

    pub fn action_error(message: impl Into<String>) -> Self {
        ServerMessage::ActionError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod protocol_tests;
