//! Home-based storage paths for quickpoll persistence.
//!
//! Everything lives under `~/.quickpoll/` unless `QUICKPOLL_HOME` points
//! elsewhere:
//! - `sessions/` - file store backend
//! - `config.yaml` - optional server configuration

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const QUICKPOLL_DIR: &str = ".quickpoll";
pub const HOME_ENV: &str = "QUICKPOLL_HOME";

/// Returns the quickpoll home directory, creating it if needed.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn quickpoll_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => dirs::home_dir()
            .context("Could not determine home directory for session storage")?
            .join(QUICKPOLL_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create quickpoll directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default file store directory: `~/.quickpoll/sessions/`
pub fn default_store_dir() -> Result<PathBuf> {
    let dir = quickpoll_home_dir()?.join("sessions");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create sessions directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default config file path: `~/.quickpoll/config.yaml`
///
/// The file itself is optional and not created here.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(quickpoll_home_dir()?.join("config.yaml"))
}
