//! Loading sync requests and account settings from JSON files
//!
//! Passwords may be left empty in the file and supplied through the
//! environment instead:
//! - `IMAP_RELAY_SOURCE_PASSWORD`
//! - `IMAP_RELAY_DESTINATION_PASSWORD`

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::imap::ImapConfig;
use crate::sync::{validate_config, SyncOptions};

pub const SOURCE_PASSWORD_ENV: &str = "IMAP_RELAY_SOURCE_PASSWORD";
pub const DESTINATION_PASSWORD_ENV: &str = "IMAP_RELAY_DESTINATION_PASSWORD";

/// Everything needed to start one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub source: ImapConfig,
    pub destination: ImapConfig,
    #[serde(default)]
    pub options: SyncOptions,
}

impl SyncRequest {
    /// Read a request file, fill empty passwords from the environment and
    /// validate the result.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let mut request: SyncRequest = load_json_file(path)?;
        request.fill_passwords(|name| std::env::var(name).ok());
        request.validate()?;
        Ok(request)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Config(format!("Failed to parse sync request: {e}")))
    }

    /// Fill empty passwords through `lookup`, keyed by environment variable name.
    pub fn fill_passwords<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fill_password(&mut self.source, SOURCE_PASSWORD_ENV, &lookup);
        fill_password(&mut self.destination, DESTINATION_PASSWORD_ENV, &lookup);
    }

    pub fn validate(&self) -> SyncResult<()> {
        validate_config(&self.source, "Source")?;
        validate_config(&self.destination, "Destination")?;
        self.options.validate()
    }
}

/// Read a single account's settings, for probing or emptying it.
///
/// An empty password is taken from `password_env` when set.
pub fn load_account(path: &Path, password_env: &str) -> SyncResult<ImapConfig> {
    let mut config: ImapConfig = load_json_file(path)?;
    fill_password(&mut config, password_env, &|name| std::env::var(name).ok());
    validate_config(&config, "Account")?;
    Ok(config)
}

fn fill_password<F>(config: &mut ImapConfig, variable: &str, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    if !config.password.is_empty() {
        return;
    }
    if let Some(password) = lookup(variable).filter(|p| !p.is_empty()) {
        log::debug!("Using password for {} from {variable}", config.label());
        config.password = password;
    }
}

fn load_json_file<T: for<'de> Deserialize<'de>>(path: &Path) -> SyncResult<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| SyncError::Config(format!("Failed to parse {}: {e}", path.display())))
}
