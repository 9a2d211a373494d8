//! Shared session store.
//!
//! Sessions are stored as whole snapshots keyed by join code, with an expiry
//! that is refreshed on every write. The store also keeps the
//! identity → session association used to stop one identity from holding two
//! live sessions.
//!
//! The store makes no atomicity promises across calls; callers serialize
//! load → mutate → store sequences with the per-session lock.

pub mod file;
pub mod memory;

#[cfg(test)]
#[path = "tests/store_contract_tests.rs"]
mod store_contract_tests;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::StoreConfig;
use crate::domain::{Identity, JoinCode, Session};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Storage backend for sessions and identity associations.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads a live session. Expired entries read as absent.
    async fn get(&self, code: &JoinCode) -> Result<Option<Session>>;

    /// Writes the session and resets its expiry to `ttl` from now.
    async fn set(&self, session: &Session, ttl: Duration) -> Result<()>;

    /// Removes the session. Deleting an absent session is not an error.
    async fn delete(&self, code: &JoinCode) -> Result<()>;

    /// Whether a live session currently holds `code`.
    async fn exists(&self, code: &JoinCode) -> Result<bool>;

    /// Records that `identity` belongs to the session `code`.
    async fn bind_identity(&self, identity: &Identity, code: &JoinCode, ttl: Duration)
        -> Result<()>;

    /// The session `identity` was last bound to, if the binding has not expired.
    async fn bound_session(&self, identity: &Identity) -> Result<Option<JoinCode>>;

    async fn unbind_identity(&self, identity: &Identity) -> Result<()>;

    /// Drops expired entries eagerly. Returns the number of sessions removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// Opens the backend selected by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn SessionStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::File { dir } => {
            let dir = match dir {
                Some(dir) => dir.clone(),
                None => crate::paths::default_store_dir()?,
            };
            Ok(Arc::new(FileStore::open(&dir)?))
        }
    }
}
