use crate::domain::MAX_PARTICIPANTS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BIND_ENV: &str = "QUICKPOLL_BIND";
pub const SESSION_TTL_ENV: &str = "QUICKPOLL_SESSION_TTL_SECS";
pub const STORE_DIR_ENV: &str = "QUICKPOLL_STORE_DIR";

/// Upper bound for `max_timer_secs` (one day).
const MAX_TIMER_SECS_LIMIT: u64 = 86_400;

/// Upper bound for `session_ttl_secs` (30 days).
const MAX_SESSION_TTL_SECS: u64 = 30 * 86_400;

/// Session store backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process store; sessions are lost on restart
    #[default]
    Memory,
    /// JSON files in `dir` (defaults to `~/.quickpoll/sessions`)
    File {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
}

/// Server configuration.
///
/// Every field is optional in the YAML file; missing fields take the
/// defaults below.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address for the TCP transport. Default: 127.0.0.1:7878
    pub bind_addr: String,
    /// Idle lifetime of a session, refreshed on every write. Default: 2 hours
    pub session_ttl_secs: u64,
    /// Participant cap, at most 25. Default: 25
    pub max_participants: usize,
    /// Round timer polling tick. Default: 1000ms
    pub timer_tick_ms: u64,
    /// Longest accepted round timer; longer requests are clamped. Default: 1 hour
    pub max_timer_secs: u64,
    /// How often expired sessions are swept from in-memory tables. Default: 30s
    pub sweep_interval_secs: u64,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7878".to_string(),
            session_ttl_secs: 7200,
            max_participants: MAX_PARTICIPANTS,
            timer_tick_ms: 1000,
            max_timer_secs: 3600,
            sweep_interval_secs: 30,
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document means "all defaults"
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Loads `path` if given, otherwise the default config file when it
    /// exists, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match crate::paths::default_config_path() {
            Ok(default_path) if default_path.exists() => Self::load(&default_path),
            Ok(_) => Ok(Self::default()),
            Err(e) => {
                tracing::debug!(error = %e, "no home directory, using default config");
                Ok(Self::default())
            }
        }
    }

    /// Applies `QUICKPOLL_*` environment overrides.
    ///
    /// Unparseable numeric values are ignored with a warning so a typo in the
    /// environment does not keep the server from starting.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var(BIND_ENV) {
            if !bind.trim().is_empty() {
                self.bind_addr = bind.trim().to_string();
            }
        }

        if let Ok(raw) = std::env::var(SESSION_TTL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.session_ttl_secs = secs,
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid {}", SESSION_TTL_ENV);
                }
            }
        }

        if let Some(dir) = std::env::var_os(STORE_DIR_ENV) {
            if !dir.is_empty() {
                self.store = StoreConfig::File {
                    dir: Some(PathBuf::from(dir)),
                };
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            anyhow::bail!("bind_addr must not be empty");
        }

        if !(1..=MAX_SESSION_TTL_SECS).contains(&self.session_ttl_secs) {
            anyhow::bail!(
                "session_ttl_secs must be between 1 and {}, got {}",
                MAX_SESSION_TTL_SECS,
                self.session_ttl_secs
            );
        }

        if self.timer_tick_ms == 0 {
            anyhow::bail!("timer_tick_ms must be greater than zero");
        }

        if !(1..=MAX_TIMER_SECS_LIMIT).contains(&self.max_timer_secs) {
            anyhow::bail!(
                "max_timer_secs must be between 1 and {}, got {}",
                MAX_TIMER_SECS_LIMIT,
                self.max_timer_secs
            );
        }

        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be greater than zero");
        }

        if !(1..=MAX_PARTICIPANTS).contains(&self.max_participants) {
            anyhow::bail!(
                "max_participants must be between 1 and {}, got {}",
                MAX_PARTICIPANTS,
                self.max_participants
            );
        }

        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
