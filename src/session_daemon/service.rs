//! Session orchestration.
//!
//! `VotingService` turns client messages into state machine commands. Every
//! command runs as lock → load → apply → store → broadcast → unlock for its
//! session, so concurrent actions on one session never lose updates while
//! different sessions proceed in parallel.

use super::broadcast::Broadcaster;
use super::lock_manager::LockManager;
use super::protocol::{ClientMessage, ServerMessage};
use super::round_timer::RoundTimers;
use super::routing::{Binding, ConnectionId, Outbox, RoutingTable};
use crate::config::ServerConfig;
use crate::domain::{
    Identity, JoinCode, Role, Session, SessionCommand, SessionError, SessionEvent, SessionMachine,
    MAX_PARTICIPANTS,
};
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attempts at drawing an unused join code before giving up.
const CODE_ATTEMPTS: usize = 256;

/// Tunables taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub session_ttl: Duration,
    pub max_participants: usize,
    pub max_timer_secs: u64,
    pub timer_tick: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl ServiceSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            session_ttl: config.session_ttl(),
            max_participants: config.max_participants.min(MAX_PARTICIPANTS),
            max_timer_secs: config.max_timer_secs,
            timer_tick: config.timer_tick(),
        }
    }
}

/// Shared handle to the voting core. Cheap to clone.
#[derive(Clone)]
pub struct VotingService {
    store: Arc<dyn SessionStore>,
    locks: Arc<LockManager>,
    routing: Arc<RoutingTable>,
    timers: Arc<RoundTimers>,
    broadcaster: Broadcaster,
    machine: SessionMachine,
    settings: ServiceSettings,
    next_connection: Arc<AtomicU64>,
}

fn infra(err: anyhow::Error) -> SessionError {
    SessionError::infrastructure(err)
}

impl VotingService {
    pub fn new(store: Arc<dyn SessionStore>, settings: ServiceSettings) -> Self {
        let routing = Arc::new(RoutingTable::new());
        Self {
            store,
            locks: Arc::new(LockManager::new()),
            broadcaster: Broadcaster::new(routing.clone()),
            routing,
            timers: Arc::new(RoundTimers::new(settings.timer_tick)),
            machine: SessionMachine::new(settings.max_participants),
            settings,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn timers(&self) -> &Arc<RoundTimers> {
        &self.timers
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Registers a new transport connection and returns its id.
    pub async fn connect(&self, outbox: Outbox) -> ConnectionId {
        let conn = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.routing.register(conn, outbox).await;
        debug!(conn, "connection registered");
        conn
    }

    /// Handles one client message. Failures are reported to `conn` only.
    pub async fn handle(&self, conn: ConnectionId, message: ClientMessage) {
        let result = match message {
            ClientMessage::Ping => {
                self.routing.send(conn, ServerMessage::Pong).await;
                Ok(())
            }
            ClientMessage::Start { identity } => self.start(conn, identity.as_deref()).await,
            ClientMessage::Join {
                code,
                display_name,
                identity,
            } => {
                self.join(conn, &code, &display_name, identity.as_deref())
                    .await
            }
            ClientMessage::Reconnect { identity, code } => {
                self.reconnect(conn, &identity, &code).await
            }
            ClientMessage::CloseDoors => self
                .member_command(conn, SessionCommand::CloseDoors)
                .await
                .map(|_| ()),
            ClientMessage::OpenVote { timer_seconds } => self.open_vote(conn, timer_seconds).await,
            ClientMessage::CloseVote => self
                .member_command(conn, SessionCommand::CloseVote)
                .await
                .map(|_| ()),
            ClientMessage::CastVote { value } => self.cast_vote(conn, &value).await,
            ClientMessage::End => self.end(conn).await,
        };

        if let Err(err) = result {
            self.report(conn, &err).await;
        }
    }

    async fn report(&self, conn: ConnectionId, err: &SessionError) {
        if err.is_infrastructure() {
            error!(conn, error = %err, "action failed on storage");
        } else {
            debug!(conn, error = %err, "action rejected");
        }
        self.routing
            .send(conn, ServerMessage::action_error(err.user_message()))
            .await;
    }

    async fn start(&self, conn: ConnectionId, requested: Option<&str>) -> Result<(), SessionError> {
        let identity = resolve_identity(requested)?;
        self.ensure_connection_free(conn, &identity, None).await?;
        self.ensure_identity_free(&identity, None).await?;

        for _ in 0..CODE_ATTEMPTS {
            let code = JoinCode::random(&mut rand::thread_rng());
            let _lock = self.locks.acquire(&code).await;
            if self.store.exists(&code).await.map_err(infra)? {
                continue;
            }

            let session = Session::new(code.clone(), identity.clone(), Utc::now());
            self.persist(&session).await?;
            self.attach(conn, &identity, &session, None).await;
            self.broadcaster.publish(&session).await;
            info!(code = %code, coordinator = %identity.fingerprint(), "session created");
            return Ok(());
        }

        warn!("no free join code after {} attempts", CODE_ATTEMPTS);
        Err(SessionError::Conflict {
            message: "No join codes available, try again later".to_string(),
        })
    }

    async fn join(
        &self,
        conn: ConnectionId,
        raw_code: &str,
        display_name: &str,
        requested: Option<&str>,
    ) -> Result<(), SessionError> {
        let code = JoinCode::parse(raw_code.trim())?;
        let identity = resolve_identity(requested)?;
        self.ensure_connection_free(conn, &identity, Some(&code)).await?;
        self.ensure_identity_free(&identity, Some(&code)).await?;

        let command = SessionCommand::Join {
            identity: identity.clone(),
            display_name: display_name.to_string(),
        };
        self.mutate(&code, Some(&identity), command, Some(conn))
            .await?;
        Ok(())
    }

    /// Re-associates `conn` with a previous role. Caller errors become
    /// `reconnectFailed` so the client can drop its stored identity.
    async fn reconnect(
        &self,
        conn: ConnectionId,
        raw_identity: &str,
        raw_code: &str,
    ) -> Result<(), SessionError> {
        let attempt = async {
            let identity = Identity::parse(raw_identity.trim())?;
            let code = JoinCode::parse(raw_code.trim())?;
            self.ensure_connection_free(conn, &identity, Some(&code))
                .await?;
            self.mutate(&code, Some(&identity), SessionCommand::Reconnect, Some(conn))
                .await?;
            Ok::<_, SessionError>((identity, code))
        };

        match attempt.await {
            Ok((identity, code)) => {
                info!(code = %code, identity = %identity.fingerprint(), "reconnected");
                Ok(())
            }
            // The stored identity is still good; only this connection is busy
            Err(err @ SessionError::Conflict { .. }) => Err(err),
            Err(err) if err.is_infrastructure() => Err(err),
            Err(err) => {
                info!(conn, reason = %err, "reconnect failed");
                self.routing.send(conn, ServerMessage::ReconnectFailed).await;
                self.routing
                    .send(
                        conn,
                        ServerMessage::Role {
                            role: Role::Unassigned,
                        },
                    )
                    .await;
                Ok(())
            }
        }
    }

    async fn member_command(
        &self,
        conn: ConnectionId,
        command: SessionCommand,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let Binding { identity, code } = self.caller(conn).await?;
        let (_, events) = self.mutate(&code, Some(&identity), command, None).await?;
        Ok(events)
    }

    async fn open_vote(
        &self,
        conn: ConnectionId,
        timer_seconds: Option<u64>,
    ) -> Result<(), SessionError> {
        let deadline = match timer_seconds.filter(|secs| *secs > 0) {
            Some(secs) => Some(round_deadline(secs.min(self.settings.max_timer_secs))?),
            None => None,
        };
        self.member_command(conn, SessionCommand::OpenVote { deadline })
            .await?;
        Ok(())
    }

    async fn cast_vote(
        &self,
        conn: ConnectionId,
        value: &serde_json::Value,
    ) -> Result<(), SessionError> {
        let value = whole_number(value).ok_or_else(|| SessionError::Validation {
            message: "Vote must be a whole number".to_string(),
        })?;
        let events = self
            .member_command(conn, SessionCommand::CastVote { value })
            .await?;

        for event in events {
            if let SessionEvent::VoteCast { value, .. } = event {
                self.routing
                    .send(conn, ServerMessage::VoteAcknowledged { value })
                    .await;
            }
        }
        Ok(())
    }

    async fn end(&self, conn: ConnectionId) -> Result<(), SessionError> {
        let Binding { identity, code } = self.caller(conn).await?;
        let lock = self.locks.acquire(&code).await;
        let mut session = self.load(&code).await?;
        self.machine
            .apply(&mut session, Some(&identity), SessionCommand::End, Utc::now())?;

        self.store.delete(&code).await.map_err(infra)?;
        for member in session.members() {
            if let Err(e) = self.store.unbind_identity(&member).await {
                warn!(code = %code, identity = %member.fingerprint(), error = %e, "failed to unbind identity");
            }
        }
        self.timers.cancel(&code).await;
        self.broadcaster.session_ended(&code).await;
        self.routing.evict_room(&code).await;
        // Waiters queued on this lock re-check and find the session gone
        self.locks.discard(lock).await;
        info!(code = %code, "session ended");
        Ok(())
    }

    /// Forgets `conn` and marks its participant disconnected.
    ///
    /// Nothing is deleted; a later reconnect restores the role and vote.
    /// Failures are logged and not retried.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let Some(Binding { identity, code }) = self.routing.unregister(conn).await else {
            debug!(conn, "connection closed");
            return;
        };

        let _lock = self.locks.acquire(&code).await;
        // A reconnect may have raced ahead of this cleanup
        if self.routing.is_connected(&identity).await {
            return;
        }
        match self
            .mutate_locked(&code, Some(&identity), SessionCommand::MarkDisconnected, None)
            .await
        {
            Ok(_) => debug!(conn, code = %code, identity = %identity.fingerprint(), "member disconnected"),
            Err(SessionError::NotFound { .. }) => {
                debug!(conn, code = %code, "disconnect after session was gone");
            }
            Err(err) => {
                warn!(conn, code = %code, error = %err, "disconnect cleanup failed");
            }
        }
    }

    /// Drops in-memory state for sessions that expired in the store and
    /// purges expired store entries. Returns the number of sessions dropped.
    pub async fn sweep(&self) -> usize {
        let mut codes: HashSet<JoinCode> = self.routing.room_codes().await.into_iter().collect();
        codes.extend(self.timers.armed_codes().await);

        let mut dropped = 0;
        for code in codes {
            let gone = {
                let lock = self.locks.acquire(&code).await;
                match self.store.exists(&code).await {
                    Ok(true) => false,
                    Ok(false) => {
                        self.timers.cancel(&code).await;
                        self.routing.evict_room(&code).await;
                        self.locks.discard(lock).await;
                        true
                    }
                    Err(e) => {
                        warn!(code = %code, error = %e, "sweep could not check session");
                        false
                    }
                }
            };
            if gone {
                info!(code = %code, "session expired");
                dropped += 1;
            }
        }

        let pruned = self.locks.prune_idle().await;
        match self.store.purge_expired().await {
            Ok(purged) => debug!(dropped, pruned, purged, "sweep finished"),
            Err(e) => warn!(error = %e, "store purge failed"),
        }
        dropped
    }

    /// Aborts all round timers.
    pub async fn shutdown(&self) {
        self.timers.shutdown().await;
    }

    async fn caller(&self, conn: ConnectionId) -> Result<Binding, SessionError> {
        self.routing
            .binding(conn)
            .await
            .ok_or_else(SessionError::not_in_session)
    }

    async fn load(&self, code: &JoinCode) -> Result<Session, SessionError> {
        self.store
            .get(code)
            .await
            .map_err(infra)?
            .ok_or_else(SessionError::not_found)
    }

    /// Rejects a connection that already speaks for someone else in a live
    /// session. Re-sending for the same identity and session is allowed.
    async fn ensure_connection_free(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        target: Option<&JoinCode>,
    ) -> Result<(), SessionError> {
        let Some(binding) = self.routing.binding(conn).await else {
            return Ok(());
        };
        if Some(&binding.code) == target && binding.identity == *identity {
            return Ok(());
        }
        if self.store.exists(&binding.code).await.map_err(infra)? {
            return Err(SessionError::Conflict {
                message: "Already in a session".to_string(),
            });
        }
        Ok(())
    }

    /// Rejects an identity that still belongs to a different live session.
    async fn ensure_identity_free(
        &self,
        identity: &Identity,
        target: Option<&JoinCode>,
    ) -> Result<(), SessionError> {
        let Some(bound) = self.store.bound_session(identity).await.map_err(infra)? else {
            return Ok(());
        };
        if Some(&bound) == target {
            return Ok(());
        }
        if self.store.exists(&bound).await.map_err(infra)? {
            return Err(SessionError::Conflict {
                message: "Already in another session".to_string(),
            });
        }
        Ok(())
    }

    async fn mutate(
        &self,
        code: &JoinCode,
        actor: Option<&Identity>,
        command: SessionCommand,
        attach: Option<ConnectionId>,
    ) -> Result<(Session, Vec<SessionEvent>), SessionError> {
        let _lock = self.locks.acquire(code).await;
        self.mutate_locked(code, actor, command, attach).await
    }

    /// Load → apply → store → broadcast. The caller holds the session lock.
    async fn mutate_locked(
        &self,
        code: &JoinCode,
        actor: Option<&Identity>,
        command: SessionCommand,
        attach: Option<ConnectionId>,
    ) -> Result<(Session, Vec<SessionEvent>), SessionError> {
        let mut session = self.load(code).await?;
        let events = self.machine.apply(&mut session, actor, command, Utc::now())?;
        if events.is_empty() {
            return Ok((session, events));
        }

        self.persist(&session).await?;

        if let (Some(conn), Some(identity)) = (attach, actor) {
            self.attach(conn, identity, &session, restored_vote(&events))
                .await;
        }
        self.apply_timer_effects(code, &events).await;
        self.broadcaster.publish(&session).await;

        for event in &events {
            log_event(code, event);
        }
        Ok((session, events))
    }

    /// Writes `session` and renews every member's identity binding with the
    /// same TTL, so bindings live exactly as long as the session does.
    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let ttl = self.settings.session_ttl;
        self.store.set(session, ttl).await.map_err(infra)?;
        for member in session.members() {
            self.store
                .bind_identity(&member, &session.code, ttl)
                .await
                .map_err(infra)?;
        }
        Ok(())
    }

    /// Binds `conn` to `identity` and tells it who it is.
    async fn attach(
        &self,
        conn: ConnectionId,
        identity: &Identity,
        session: &Session,
        vote: Option<u8>,
    ) {
        self.routing.bind(conn, identity, &session.code).await;

        let role = session.role_of(identity);
        self.routing.send(conn, ServerMessage::Role { role }).await;
        self.routing
            .send(
                conn,
                ServerMessage::SessionCode {
                    code: session.code.clone(),
                },
            )
            .await;
        self.routing
            .send(
                conn,
                ServerMessage::AssignedIdentity {
                    identity: identity.clone(),
                },
            )
            .await;
        if let Some(value) = vote {
            self.routing
                .send(conn, ServerMessage::VoteAcknowledged { value })
                .await;
        }
    }

    async fn apply_timer_effects(&self, code: &JoinCode, events: &[SessionEvent]) {
        for event in events {
            match event {
                SessionEvent::RoundOpened {
                    deadline: Some(deadline),
                } => {
                    let expiry = self.clone().expire_round(code.clone(), *deadline);
                    self.timers.arm(code, *deadline, expiry).await;
                }
                SessionEvent::RoundOpened { deadline: None } | SessionEvent::RoundClosed { .. } => {
                    self.timers.cancel(code).await;
                }
                _ => {}
            }
        }
    }

    /// Closes the round for `code` if `deadline` is still the live one.
    fn expire_round(self, code: JoinCode, deadline: DateTime<Utc>) -> BoxFuture<'static, ()> {
        async move {
            let command = SessionCommand::ExpireRound { deadline };
            match self.mutate(&code, None, command, None).await {
                Ok((_, events)) if events.is_empty() => {
                    debug!(code = %code, "stale round timer ignored");
                }
                Ok(_) => {}
                Err(SessionError::NotFound { .. }) => {
                    debug!(code = %code, "round timer fired for a gone session");
                }
                Err(err) => {
                    error!(code = %code, error = %err, "round timer could not close the round");
                }
            }
        }
        .boxed()
    }
}

fn resolve_identity(requested: Option<&str>) -> Result<Identity, SessionError> {
    match requested.map(str::trim) {
        Some(raw) if !raw.is_empty() => Identity::parse(raw),
        _ => Ok(Identity::generate()),
    }
}

fn round_deadline(secs: u64) -> Result<DateTime<Utc>, SessionError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|length| Utc::now().checked_add_signed(length))
        .ok_or_else(|| SessionError::Validation {
            message: "Timer is too long".to_string(),
        })
}

/// Accepts JSON integers and integral floats such as `4.0`.
fn whole_number(value: &serde_json::Value) -> Option<i64> {
    if let Some(int) = value.as_i64() {
        return Some(int);
    }
    let float = value.as_f64()?;
    if float.fract() == 0.0 && float.abs() <= 1_000_000.0 {
        Some(float as i64)
    } else {
        None
    }
}

fn restored_vote(events: &[SessionEvent]) -> Option<u8> {
    events.iter().find_map(|event| match event {
        SessionEvent::Reconnected { vote, .. } | SessionEvent::ParticipantRejoined { vote, .. } => {
            *vote
        }
        _ => None,
    })
}

fn log_event(code: &JoinCode, event: &SessionEvent) {
    match event {
        SessionEvent::ParticipantJoined { identity, .. } => {
            info!(code = %code, identity = %identity.fingerprint(), "participant joined");
        }
        SessionEvent::ParticipantRejoined { identity, .. } => {
            info!(code = %code, identity = %identity.fingerprint(), "participant rejoined");
        }
        SessionEvent::DoorsClosed => info!(code = %code, "doors closed"),
        SessionEvent::RoundOpened { deadline } => {
            info!(code = %code, deadline = ?deadline, "round opened");
        }
        SessionEvent::RoundClosed {
            average,
            voter_count,
            recorded,
            by_timer,
        } => {
            info!(
                code = %code,
                average = ?average,
                voter_count,
                recorded,
                by_timer,
                "round closed"
            );
        }
        SessionEvent::VoteCast {
            identity, replaced, ..
        } => {
            debug!(code = %code, identity = %identity.fingerprint(), replaced, "vote cast");
        }
        SessionEvent::Reconnected { identity, role, .. } => {
            debug!(code = %code, identity = %identity.fingerprint(), role = ?role, "role restored");
        }
        SessionEvent::Disconnected { identity } => {
            debug!(code = %code, identity = %identity.fingerprint(), "participant disconnected");
        }
        SessionEvent::Ended => {}
    }
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod service_tests;

#[cfg(test)]
#[path = "tests/service_lifecycle_tests.rs"]
mod service_lifecycle_tests;
