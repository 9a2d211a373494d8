//! File-backed session store.
//!
//! Layout under the store directory:
//! - `<code>.json` - one envelope per session
//! - `identities/<sha256>.json` - one envelope per identity binding
//! - `.lock` - held exclusively for the lifetime of the store
//!
//! Each envelope carries an absolute `expiresAt`, so sessions survive a
//! restart until their expiry. Writes go to a temp file and are renamed into
//! place.

use super::SessionStore;
use crate::domain::{Identity, JoinCode, Session};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const IDENTITIES_DIR: &str = "identities";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    expires_at: DateTime<Utc>,
    payload: T,
}

impl<T> Envelope<T> {
    fn new(payload: T, ttl: Duration) -> Result<Self> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .with_context(|| format!("TTL of {}s is out of range", ttl.as_secs()))?;
        Ok(Self {
            expires_at,
            payload,
        })
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Session store persisting JSON envelopes in a directory.
pub struct FileStore {
    dir: PathBuf,
    /// Exclusive lock on `.lock`, released when the store is dropped
    _lock: File,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another process already holds the store lock
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join(IDENTITIES_DIR))
            .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open store lock: {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "Store directory {} is in use by another process",
                dir.display()
            )
        })?;

        tracing::debug!(dir = %dir.display(), "file store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, code: &JoinCode) -> PathBuf {
        self.dir.join(format!("{}.json", code.as_str()))
    }

    fn identity_path(&self, identity: &Identity) -> PathBuf {
        self.dir
            .join(IDENTITIES_DIR)
            .join(format!("{}.json", identity.storage_key()))
    }
}

async fn write_envelope<T: Serialize>(path: &Path, envelope: &Envelope<T>) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let content = serde_json::to_string(envelope).context("Failed to serialize store entry")?;

    tokio::fs::write(&temp_path, content)
        .await
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
    Ok(())
}

/// Reads a live envelope payload; missing and expired entries read as `None`.
/// Expired entries are removed on the way out.
async fn read_live<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read: {}", path.display()));
        }
    };
    let envelope: Envelope<T> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse store entry: {}", path.display()))?;

    if envelope.is_live(Utc::now()) {
        Ok(Some(envelope.payload))
    } else {
        remove_if_present(path).await?;
        Ok(None)
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete: {}", path.display())),
    }
}

/// Removes expired `.json` envelopes in `dir`. Returns how many were removed.
async fn purge_dir(dir: &Path) -> Result<usize> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Expiry {
        expires_at: DateTime<Utc>,
    }

    let now = Utc::now();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read store directory: {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        match serde_json::from_str::<Expiry>(&content) {
            Ok(expiry) if expiry.expires_at <= now => {
                remove_if_present(&path).await?;
                removed += 1;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable store entry");
            }
        }
    }
    Ok(removed)
}

#[async_trait]
impl SessionStore for FileStore {
    async fn get(&self, code: &JoinCode) -> Result<Option<Session>> {
        read_live(&self.session_path(code)).await
    }

    async fn set(&self, session: &Session, ttl: Duration) -> Result<()> {
        let envelope = Envelope::new(session, ttl)?;
        write_envelope(&self.session_path(&session.code), &envelope).await
    }

    async fn delete(&self, code: &JoinCode) -> Result<()> {
        remove_if_present(&self.session_path(code)).await
    }

    async fn exists(&self, code: &JoinCode) -> Result<bool> {
        Ok(self.get(code).await?.is_some())
    }

    async fn bind_identity(
        &self,
        identity: &Identity,
        code: &JoinCode,
        ttl: Duration,
    ) -> Result<()> {
        let envelope = Envelope::new(code, ttl)?;
        write_envelope(&self.identity_path(identity), &envelope).await
    }

    async fn bound_session(&self, identity: &Identity) -> Result<Option<JoinCode>> {
        read_live(&self.identity_path(identity)).await
    }

    async fn unbind_identity(&self, identity: &Identity) -> Result<()> {
        remove_if_present(&self.identity_path(identity)).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let removed = purge_dir(&self.dir).await?;
        purge_dir(&self.dir.join(IDENTITIES_DIR)).await?;
        Ok(removed)
    }
}
