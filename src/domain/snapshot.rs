//! Redacted projection of a session sent to clients.
//!
//! Carries who has voted, never what they voted in the active round.

use super::types::{Identity, JoinCode, Round, Session, SessionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub identity: Identity,
    pub display_name: String,
    pub has_voted: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub code: JoinCode,
    pub state: SessionState,
    pub participant_count: usize,
    pub average: Option<f64>,
    /// In join order
    pub participants: Vec<ParticipantView>,
    pub vote_count: usize,
    pub history: Vec<Round>,
    /// Clients count down locally from this absolute deadline
    pub timer_deadline: Option<DateTime<Utc>>,
    pub round_number: u32,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        let mut participants: Vec<_> = session.participants.iter().collect();
        participants.sort_by(|(a_id, a), (b_id, b)| {
            a.joined_at.cmp(&b.joined_at).then_with(|| a_id.cmp(b_id))
        });

        Self {
            code: session.code.clone(),
            state: session.state,
            participant_count: session.participants.len(),
            average: session.average,
            participants: participants
                .into_iter()
                .map(|(identity, p)| ParticipantView {
                    identity: identity.clone(),
                    display_name: p.display_name.clone(),
                    has_voted: session.votes.contains_key(identity),
                    connected: p.connected,
                })
                .collect(),
            vote_count: session.votes.len(),
            history: session.history.clone(),
            timer_deadline: session.timer_deadline,
            round_number: session.round_number(),
        }
    }
}
