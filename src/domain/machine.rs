//! Session state machine.
//!
//! The ONLY place session data is mutated. Every command is fully validated
//! before anything is touched, so a rejected command leaves the session exactly
//! as it was. The caller owns load/store and locking.

use super::errors::SessionError;
use super::types::{
    normalize_display_name, round_average, Identity, Participant, Role, Round, RoundVote,
    Session, SessionState, MAX_PARTICIPANTS, MAX_VOTE, MIN_VOTE,
};
use chrono::{DateTime, Utc};

/// Commands accepted by [`SessionMachine::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Join as participant; a known identity rejoins in any state
    Join {
        identity: Identity,
        display_name: String,
    },
    CloseDoors,
    /// Start a round; `deadline` is set when a round timer is requested
    OpenVote { deadline: Option<DateTime<Utc>> },
    CloseVote,
    /// Timer-driven close; a no-op unless the deadline is still current
    ExpireRound { deadline: DateTime<Utc> },
    CastVote { value: i64 },
    Reconnect,
    MarkDisconnected,
    End,
}

/// Events emitted by a successful command. An empty list means nothing changed
/// and nothing needs to be written or broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined {
        identity: Identity,
        display_name: String,
    },
    ParticipantRejoined {
        identity: Identity,
        vote: Option<u8>,
    },
    DoorsClosed,
    RoundOpened {
        deadline: Option<DateTime<Utc>>,
    },
    RoundClosed {
        average: Option<f64>,
        voter_count: u32,
        recorded: bool,
        by_timer: bool,
    },
    VoteCast {
        identity: Identity,
        value: u8,
        replaced: bool,
    },
    Reconnected {
        identity: Identity,
        role: Role,
        vote: Option<u8>,
    },
    Disconnected {
        identity: Identity,
    },
    Ended,
}

/// Validates and applies commands against a loaded [`Session`].
#[derive(Debug, Clone, Copy)]
pub struct SessionMachine {
    max_participants: usize,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(MAX_PARTICIPANTS)
    }
}

impl SessionMachine {
    /// `max_participants` is clamped to the hard cap of 25.
    pub fn new(max_participants: usize) -> Self {
        Self {
            max_participants: max_participants.min(MAX_PARTICIPANTS),
        }
    }

    /// Applies `command` on behalf of `actor`.
    ///
    /// `actor` is `None` only for system-driven commands (round timer).
    pub fn apply(
        &self,
        session: &mut Session,
        actor: Option<&Identity>,
        command: SessionCommand,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let events = self.apply_internal(session, actor, command, now)?;
        if !events.is_empty() {
            session.updated_at = now;
        }
        Ok(events)
    }

    fn apply_internal(
        &self,
        session: &mut Session,
        actor: Option<&Identity>,
        command: SessionCommand,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        use SessionCommand::*;
        use SessionEvent::*;

        match command {
            Join {
                identity,
                display_name,
            } => self.join(session, identity, &display_name, now),

            CloseDoors => {
                require_coordinator(session, actor)?;
                require_state(session, &[SessionState::Open], "Doors are already closed")?;
                session.state = SessionState::Closed;
                Ok(vec![DoorsClosed])
            }

            OpenVote { deadline } => {
                require_coordinator(session, actor)?;
                require_state(
                    session,
                    &[SessionState::Closed, SessionState::Results],
                    "Close the doors before voting",
                )?;
                session.votes.clear();
                session.average = None;
                session.timer_deadline = deadline;
                session.state = SessionState::Voting;
                Ok(vec![RoundOpened { deadline }])
            }

            CloseVote => {
                require_coordinator(session, actor)?;
                require_state(session, &[SessionState::Voting], "Voting is not open")?;
                Ok(vec![close_round(session, false)])
            }

            ExpireRound { deadline } => {
                let current = session.state == SessionState::Voting
                    && session.timer_deadline == Some(deadline);
                if !current || now < deadline {
                    return Ok(vec![]);
                }
                Ok(vec![close_round(session, true)])
            }

            CastVote { value } => {
                let identity = actor.ok_or_else(SessionError::not_in_session)?;
                require_state(session, &[SessionState::Voting], "Voting is not open")?;
                if !session.is_participant(identity) {
                    return Err(SessionError::Authorization {
                        message: "Only participants can vote".to_string(),
                    });
                }
                let value = vote_value(value)?;
                let replaced = session.votes.insert(identity.clone(), value).is_some();
                Ok(vec![VoteCast {
                    identity: identity.clone(),
                    value,
                    replaced,
                }])
            }

            Reconnect => {
                let identity = actor.ok_or_else(SessionError::not_in_session)?;
                let role = session.role_of(identity);
                if role == Role::Unassigned {
                    return Err(SessionError::NotFound {
                        message: "Unknown identity for this session".to_string(),
                    });
                }
                if let Some(participant) = session.participants.get_mut(identity) {
                    participant.connected = true;
                }
                Ok(vec![Reconnected {
                    identity: identity.clone(),
                    role,
                    vote: active_vote(session, identity),
                }])
            }

            MarkDisconnected => {
                let Some(identity) = actor else {
                    return Ok(vec![]);
                };
                match session.participants.get_mut(identity) {
                    Some(participant) if participant.connected => {
                        participant.connected = false;
                        Ok(vec![Disconnected {
                            identity: identity.clone(),
                        }])
                    }
                    // Coordinator association is kept for reconnect
                    _ => Ok(vec![]),
                }
            }

            End => {
                require_coordinator(session, actor)?;
                Ok(vec![Ended])
            }
        }
    }

    fn join(
        &self,
        session: &mut Session,
        identity: Identity,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if session.is_coordinator(&identity) {
            return Err(SessionError::Conflict {
                message: "The coordinator cannot join as a participant".to_string(),
            });
        }

        if let Some(participant) = session.participants.get_mut(&identity) {
            participant.connected = true;
            let vote = active_vote(session, &identity);
            return Ok(vec![SessionEvent::ParticipantRejoined { identity, vote }]);
        }

        if session.state != SessionState::Open {
            return Err(SessionError::State {
                message: "Session is closed to new participants".to_string(),
            });
        }
        if session.participants.len() >= self.max_participants {
            return Err(SessionError::State {
                message: "Session is full".to_string(),
            });
        }

        let display_name = normalize_display_name(display_name);
        session.participants.insert(
            identity.clone(),
            Participant {
                display_name: display_name.clone(),
                connected: true,
                joined_at: now,
            },
        );
        Ok(vec![SessionEvent::ParticipantJoined {
            identity,
            display_name,
        }])
    }
}

fn require_coordinator(session: &Session, actor: Option<&Identity>) -> Result<(), SessionError> {
    match actor {
        Some(identity) if session.is_coordinator(identity) => Ok(()),
        _ => Err(SessionError::coordinator_only()),
    }
}

fn require_state(
    session: &Session,
    allowed: &[SessionState],
    message: &str,
) -> Result<(), SessionError> {
    if allowed.contains(&session.state) {
        Ok(())
    } else {
        Err(SessionError::State {
            message: message.to_string(),
        })
    }
}

fn vote_value(value: i64) -> Result<u8, SessionError> {
    if !(MIN_VOTE..=MAX_VOTE).contains(&value) {
        return Err(SessionError::Validation {
            message: format!("Vote must be between {} and {}", MIN_VOTE, MAX_VOTE),
        });
    }
    u8::try_from(value).map_err(|_| SessionError::Validation {
        message: format!("Vote must be between {} and {}", MIN_VOTE, MAX_VOTE),
    })
}

/// The caller's vote in the round currently being voted on, if any.
fn active_vote(session: &Session, identity: &Identity) -> Option<u8> {
    if session.state == SessionState::Voting {
        session.votes.get(identity).copied()
    } else {
        None
    }
}

fn close_round(session: &mut Session, by_timer: bool) -> SessionEvent {
    let average = round_average(session.votes.values().copied());
    let voter_count = u32::try_from(session.votes.len()).unwrap_or(u32::MAX);

    let recorded = match average {
        Some(average) => {
            let mut votes_by_name: Vec<RoundVote> = session
                .votes
                .iter()
                .map(|(identity, value)| RoundVote {
                    display_name: session
                        .participants
                        .get(identity)
                        .map(|p| p.display_name.clone())
                        .unwrap_or_default(),
                    value: *value,
                })
                .collect();
            votes_by_name.sort_by(|a, b| {
                a.display_name
                    .cmp(&b.display_name)
                    .then(a.value.cmp(&b.value))
            });
            let sequence_number = session.round_number() + 1;
            session.history.push(Round {
                sequence_number,
                average,
                voter_count,
                votes_by_name,
            });
            true
        }
        None => false,
    };

    session.average = average;
    session.timer_deadline = None;
    session.state = SessionState::Results;

    SessionEvent::RoundClosed {
        average,
        voter_count,
        recorded,
        by_timer,
    }
}
