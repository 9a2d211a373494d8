//! Round timers.
//!
//! At most one timer per session. A timer polls on a fixed tick and, once the
//! deadline has passed, disarms itself and runs its expiry future (which
//! closes the round under the session lock). Ticks before the deadline do
//! nothing; clients count down from the deadline in the snapshot.

use crate::domain::JoinCode;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct ArmedTimer {
    generation: u64,
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

pub struct RoundTimers {
    tick: Duration,
    timers: Arc<Mutex<HashMap<JoinCode, ArmedTimer>>>,
    next_generation: AtomicU64,
}

impl RoundTimers {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Arms the timer for `code`, replacing any timer already armed for it.
    pub async fn arm(
        &self,
        code: &JoinCode,
        deadline: DateTime<Utc>,
        on_expiry: BoxFuture<'static, ()>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers = self.timers.clone();
        let tick = self.tick;
        let task_code = code.clone();

        // Held across spawn and insert so the task cannot look itself up
        // before it is registered.
        let mut armed = self.timers.lock().await;
        if let Some(previous) = armed.remove(code) {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if Utc::now() >= deadline {
                    break;
                }
            }

            {
                let mut armed = timers.lock().await;
                if armed
                    .get(&task_code)
                    .is_some_and(|timer| timer.generation == generation)
                {
                    armed.remove(&task_code);
                }
            }

            tracing::info!(code = %task_code, "round timer fired");
            on_expiry.await;
        });

        armed.insert(
            code.clone(),
            ArmedTimer {
                generation,
                deadline,
                handle,
            },
        );
        tracing::debug!(code = %code, deadline = %deadline, "round timer armed");
    }

    /// Cancels the timer for `code`. Returns whether one was armed.
    pub async fn cancel(&self, code: &JoinCode) -> bool {
        match self.timers.lock().await.remove(code) {
            Some(timer) => {
                timer.handle.abort();
                tracing::debug!(code = %code, "round timer cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn is_armed(&self, code: &JoinCode) -> bool {
        self.timers.lock().await.contains_key(code)
    }

    pub async fn deadline(&self, code: &JoinCode) -> Option<DateTime<Utc>> {
        self.timers.lock().await.get(code).map(|timer| timer.deadline)
    }

    pub async fn armed_codes(&self) -> Vec<JoinCode> {
        self.timers.lock().await.keys().cloned().collect()
    }

    /// Aborts every armed timer.
    pub async fn shutdown(&self) {
        let mut armed = self.timers.lock().await;
        for (_, timer) in armed.drain() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/round_timer_tests.rs"]
mod round_timer_tests;
