//! Real-time voting session server.
//!
//! ## Architecture
//!
//! - **Service (`service.rs`)**: turns client messages into state machine
//!   commands, one session lock held per command.
//! - **Lock manager (`lock_manager.rs`)**: per-session mutual exclusion.
//! - **Routing (`routing.rs`)**: connection ↔ identity ↔ session rooms.
//! - **Round timers (`round_timer.rs`)**: auto-close rounds at their deadline.
//! - **Broadcast (`broadcast.rs`)**: snapshot fan-out to a session's room.
//! - **Server (`server.rs`)**: newline-delimited JSON over TCP.
//! - **Protocol (`protocol.rs`)**: wire messages.

pub mod broadcast;
pub mod lock_manager;
pub mod protocol;
pub mod round_timer;
pub mod routing;
pub mod server;
pub mod service;

pub use protocol::{ClientMessage, ServerMessage, BUILD_SHA};
pub use server::serve;
pub use service::{ServiceSettings, VotingService};
