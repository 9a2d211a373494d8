//! In-process session store.
//!
//! Entries are kept JSON-serialized so callers never share mutable state with
//! the store, the same as with an external key-value store.

use super::SessionStore;
use crate::domain::{Identity, JoinCode, Session};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Entry {
    payload: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Session store backed by process memory, with lazy expiry.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<JoinCode, Entry>>,
    identities: Mutex<HashMap<Identity, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(ttl: Duration) -> Result<Instant> {
    Instant::now()
        .checked_add(ttl)
        .with_context(|| format!("TTL of {}s is out of range", ttl.as_secs()))
}

/// Returns the live entry for `key`, evicting it if it has expired.
fn live_entry<'a, K>(map: &'a mut HashMap<K, Entry>, key: &K) -> Option<&'a Entry>
where
    K: std::hash::Hash + Eq,
{
    let now = Instant::now();
    if map.get(key).is_some_and(|entry| !entry.is_live(now)) {
        map.remove(key);
    }
    map.get(key)
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, code: &JoinCode) -> Result<Option<Session>> {
        let mut sessions = self.sessions.lock().await;
        match live_entry(&mut sessions, code) {
            Some(entry) => {
                let session = serde_json::from_str(&entry.payload)
                    .with_context(|| format!("Failed to parse stored session {code}"))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, session: &Session, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(session).context("Failed to serialize session")?;
        let expires_at = expiry(ttl)?;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session.code.clone(),
            Entry {
                payload,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, code: &JoinCode) -> Result<()> {
        self.sessions.lock().await.remove(code);
        Ok(())
    }

    async fn exists(&self, code: &JoinCode) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        Ok(live_entry(&mut sessions, code).is_some())
    }

    async fn bind_identity(
        &self,
        identity: &Identity,
        code: &JoinCode,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = expiry(ttl)?;
        let mut identities = self.identities.lock().await;
        identities.insert(
            identity.clone(),
            Entry {
                payload: code.as_str().to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn bound_session(&self, identity: &Identity) -> Result<Option<JoinCode>> {
        let mut identities = self.identities.lock().await;
        match live_entry(&mut identities, identity) {
            Some(entry) => Ok(Some(
                JoinCode::parse(&entry.payload)
                    .map_err(|e| anyhow::anyhow!("corrupt identity binding: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    async fn unbind_identity(&self, identity: &Identity) -> Result<()> {
        self.identities.lock().await.remove(identity);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let before = sessions.len();
            sessions.retain(|_, entry| entry.is_live(now));
            before - sessions.len()
        };
        self.identities
            .lock()
            .await
            .retain(|_, entry| entry.is_live(now));
        Ok(removed)
    }
}
