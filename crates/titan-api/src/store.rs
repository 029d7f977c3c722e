//! On-disk account store
//!
//! JSON file mapping account labels to the last known credential pair, so a
//! later run can resume from a refresh credential obtained by login instead
//! of logging in again. Writes use temp-file + rename; a tokio Mutex
//! serializes writers from concurrently running accounts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credentials::CredentialManager;
use crate::error::{Error, Result};

/// Persisted credential state for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    pub refresh: String,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Unix milliseconds of the last successful refresh/login
    pub updated_at: u64,
}

impl StoredAccount {
    /// Snapshot the manager's current credential state.
    pub fn from_manager(manager: &CredentialManager) -> Self {
        Self {
            refresh: manager.refresh_token().expose().clone(),
            access: manager.access_token().map(|t| t.expose().clone()),
            user_id: manager.user_id().map(str::to_owned),
            email: manager.email().map(str::to_owned),
            updated_at: u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default(),
        }
    }
}

pub struct AccountStore {
    path: PathBuf,
    state: Mutex<HashMap<String, StoredAccount>>,
}

impl AccountStore {
    /// Load the store, creating an empty file on first use.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading account store: {e}")))?;
            let accounts: HashMap<String, StoredAccount> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing account store: {e}")))?;
            info!(path = %path.display(), accounts = accounts.len(), "loaded account store");
            accounts
        } else {
            info!(path = %path.display(), "account store not found, starting empty");
            let accounts = HashMap::new();
            write_atomic(&path, &accounts).await?;
            accounts
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn get(&self, label: &str) -> Option<StoredAccount> {
        self.state.lock().await.get(label).cloned()
    }

    /// Record an account's credentials and persist.
    pub async fn record(&self, label: &str, account: StoredAccount) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(label.to_string(), account);
        debug!(account = label, "recorded credentials");
        write_atomic(&self.path, &state).await
    }
}

/// Write the store atomically with 0600 permissions (it holds credentials).
async fn write_atomic(path: &Path, data: &HashMap<String, StoredAccount>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing account store: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp account store: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Store(format!("setting account store permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp account store: {e}")))?;

    debug!(path = %path.display(), "persisted account store");
    Ok(())
}
