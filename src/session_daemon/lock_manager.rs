//! Per-session mutual exclusion.
//!
//! Every load → mutate → store sequence on a session runs while holding that
//! session's [`SessionLock`]. Locks for different codes never contend.
//! Waiters are served in FIFO order (tokio's mutex is fair).

use crate::domain::JoinCode;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive hold on one session. Released on drop, on every exit path.
pub struct SessionLock {
    code: JoinCode,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLock {
    pub fn code(&self) -> &JoinCode {
        &self.code
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock").field("code", &self.code).finish()
    }
}

/// Table of per-code locks, created on first use.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<JoinCode, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other operation holds `code`, then takes it.
    ///
    /// If the lock is discarded while this call waits, the call retries
    /// against the fresh table entry so two holders never coexist.
    pub async fn acquire(&self, code: &JoinCode) -> SessionLock {
        loop {
            let slot = {
                let mut locks = self.locks.lock().await;
                locks
                    .entry(code.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            };

            let guard = slot.clone().lock_owned().await;

            let current = {
                let locks = self.locks.lock().await;
                locks.get(code).is_some_and(|entry| Arc::ptr_eq(entry, &slot))
            };
            if current {
                return SessionLock {
                    code: code.clone(),
                    _guard: guard,
                };
            }
            tracing::trace!(code = %code, "session lock discarded while waiting, retrying");
        }
    }

    /// Drops the table entry for a deleted session, then releases `lock`.
    ///
    /// Removal happens while `lock` is still held, so anyone already waiting
    /// on the old entry fails its re-check in [`acquire`](Self::acquire) and
    /// queues on the fresh one instead of running alongside it.
    pub async fn discard(&self, lock: SessionLock) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(&lock.code)
            .is_some_and(|entry| Arc::ptr_eq(entry, OwnedMutexGuard::mutex(&lock._guard)))
        {
            locks.remove(&lock.code);
        }
        drop(locks);
        drop(lock);
    }

    /// Removes locks that nobody holds or waits on. Returns how many were removed.
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - locks.len()
    }

    pub async fn codes(&self) -> Vec<JoinCode> {
        self.locks.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/lock_manager_tests.rs"]
mod lock_manager_tests;
