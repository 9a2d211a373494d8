//! Domain model for voting sessions.
//!
//! # Architecture
//!
//! - **Types** (`types.rs`): Session data as persisted in the store
//! - **Machine** (`machine.rs`): Command validation and the only place sessions mutate
//! - **Snapshot** (`snapshot.rs`): Redacted read-only projection for clients
//! - **Errors** (`errors.rs`): Caller-facing error taxonomy

pub mod errors;
pub mod machine;
pub mod snapshot;
pub mod types;

#[cfg(test)]
#[path = "tests/machine_tests.rs"]
mod machine_tests;

#[cfg(test)]
#[path = "tests/machine_proptests.rs"]
mod machine_proptests;

pub use errors::SessionError;
pub use machine::{SessionCommand, SessionEvent, SessionMachine};
pub use snapshot::{ParticipantView, SessionSnapshot};
pub use types::{
    normalize_display_name, round_average, Identity, JoinCode, Participant, Role, Round,
    RoundVote, Session, SessionState, MAX_PARTICIPANTS,
};
