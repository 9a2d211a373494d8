//! Core data model for voting sessions.
//!
//! A [`Session`] is the unit stored in the session store. Everything here is
//! plain data; transitions live in [`super::machine`].

use super::errors::SessionError;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Hard cap on participants per session (the coordinator is not counted).
pub const MAX_PARTICIPANTS: usize = 25;

/// Display names are truncated to this many characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 20;

/// Used when a participant joins with a blank display name.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Lowest accepted vote value.
pub const MIN_VOTE: i64 = 0;

/// Highest accepted vote value.
pub const MAX_VOTE: i64 = 6;

const MAX_IDENTITY_LEN: usize = 64;

/// Durable identity of a person across reconnects.
///
/// Distinct from the transport connection id, which changes on every reconnect.
/// The raw token is never logged; use [`Identity::fingerprint`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Generates a fresh server-side identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validates a client-supplied identity token.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let token = raw.trim();
        let well_formed = !token.is_empty()
            && token.len() <= MAX_IDENTITY_LEN
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(SessionError::Validation {
                message: "Invalid identity".to_string(),
            });
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, non-reversible tag for log lines.
    pub fn fingerprint(&self) -> String {
        self.digest_hex().chars().take(8).collect()
    }

    /// Full SHA-256 hex digest, used as a filesystem-safe storage key.
    pub fn storage_key(&self) -> String {
        self.digest_hex()
    }

    fn digest_hex(&self) -> String {
        Sha256::digest(self.0.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Four-digit numeric join code; the primary key of a session in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinCode(String);

impl JoinCode {
    pub const LEN: usize = 4;

    /// Validates a code typed by a participant.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let code = raw.trim();
        if code.len() != Self::LEN || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(SessionError::Validation {
                message: "Join code must be 4 digits".to_string(),
            });
        }
        Ok(Self(code.to_string()))
    }

    /// Draws a random candidate code in 1000..=9999.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(1000..=9999u16).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a session.
///
/// `Open -> Closed -> Voting -> Results -> Voting -> ...`; deletion is terminal
/// and is not represented as a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Accepting joins
    Open,
    /// Joins blocked, no round yet
    Closed,
    /// Round active
    Voting,
    /// Round closed, average available
    Results,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Open => write!(f, "OPEN"),
            SessionState::Closed => write!(f, "CLOSED"),
            SessionState::Voting => write!(f, "VOTING"),
            SessionState::Results => write!(f, "RESULTS"),
        }
    }
}

/// Role of a caller relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Participant,
    /// Not associated with any session
    #[serde(rename = "none")]
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub display_name: String,
    pub connected: bool,
    pub joined_at: DateTime<Utc>,
}

/// One vote as recorded in a history entry. Display only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundVote {
    pub display_name: String,
    pub value: u8,
}

/// A closed round with at least one vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    /// 1-based, equals the entry's position in history plus one
    pub sequence_number: u32,
    pub average: f64,
    pub voter_count: u32,
    /// Sorted by display name; duplicate names are kept as separate entries
    pub votes_by_name: Vec<RoundVote>,
}

/// A voting session as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub code: JoinCode,
    pub coordinator: Identity,
    pub state: SessionState,
    pub participants: HashMap<Identity, Participant>,
    pub votes: HashMap<Identity, u8>,
    pub average: Option<f64>,
    pub history: Vec<Round>,
    pub timer_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Creates a fresh `Open` session owned by `coordinator`.
    pub fn new(code: JoinCode, coordinator: Identity, now: DateTime<Utc>) -> Self {
        Self {
            code,
            coordinator,
            state: SessionState::Open,
            participants: HashMap::new(),
            votes: HashMap::new(),
            average: None,
            history: Vec::new(),
            timer_deadline: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_coordinator(&self, identity: &Identity) -> bool {
        self.coordinator == *identity
    }

    pub fn is_participant(&self, identity: &Identity) -> bool {
        self.participants.contains_key(identity)
    }

    pub fn role_of(&self, identity: &Identity) -> Role {
        if self.is_coordinator(identity) {
            Role::Coordinator
        } else if self.is_participant(identity) {
            Role::Participant
        } else {
            Role::Unassigned
        }
    }

    /// Every identity associated with this session, coordinator first.
    pub fn members(&self) -> Vec<Identity> {
        let mut members = vec![self.coordinator.clone()];
        members.extend(self.participants.keys().cloned());
        members
    }

    /// Number of rounds closed with at least one vote.
    pub fn round_number(&self) -> u32 {
        u32::try_from(self.history.len()).unwrap_or(u32::MAX)
    }
}

/// Trims, truncates and defaults a requested display name.
pub fn normalize_display_name(raw: &str) -> String {
    let name: String = raw.trim().chars().take(MAX_DISPLAY_NAME_CHARS).collect();
    let name = name.trim_end();
    if name.is_empty() {
        DEFAULT_DISPLAY_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Mean rounded half away from zero to one decimal; `None` for no votes.
pub fn round_average<I>(votes: I) -> Option<f64>
where
    I: IntoIterator<Item = u8>,
{
    let (sum, count) = votes
        .into_iter()
        .fold((0u64, 0u64), |(sum, count), v| (sum + u64::from(v), count + 1));
    if count == 0 {
        return None;
    }
    // Integer tenths, so exact halves such as 0.35 never drift below .5
    let tenths = (20 * sum + count) / (2 * count);
    Some(tenths as f64 / 10.0)
}
