//! Durable storage for the avatar-tool authentication credential
//!
//! One credential per installation, held in a small JSON file. The store
//! owns the durable copy; managers only ever hold the token in memory for
//! the duration of a connection attempt. Read at the start of every auth
//! flow, written when the remote party issues a token, deleted when it
//! rejects one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::{Result, StagehandError};

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    #[serde(rename = "authenticationToken")]
    authentication_token: String,
    #[serde(rename = "savedAt", default)]
    saved_at: Option<String>,
}

/// File-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted token. Absent and unreadable files both resolve
    /// to `None`; a missing credential is a normal state, not an error.
    pub fn load(&self) -> Option<String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file unreadable");
                return None;
            }
        };

        match serde_json::from_str::<StoredCredential>(&raw) {
            Ok(stored) if !stored.authentication_token.is_empty() => {
                Some(stored.authentication_token)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file corrupt");
                None
            }
        }
    }

    /// Persist a freshly issued token, replacing any previous one.
    pub fn save(&self, token: &str) -> Result<()> {
        let stored = StoredCredential {
            authentication_token: token.to_string(),
            saved_at: Some(Utc::now().to_rfc3339()),
        };
        let raw = serde_json::to_string(&stored)?;
        fs::write(&self.path, raw)
            .map_err(|e| StagehandError::Credential(format!("write {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "credential saved");
        Ok(())
    }

    /// Delete the persisted token. Called when the remote party rejects
    /// it; deleting an already-absent file is a no-op.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "credential cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "credential clear failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("token.json"))
    }

    #[test]
    fn test_load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_in(&dir).load(), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save("tok-123").unwrap();
        assert_eq!(store.load(), Some("tok-123".to_string()));

        // A fresh store pointed at the same path sees the same token.
        let fresh = CredentialStore::new(store.path());
        assert_eq!(fresh.load(), Some("tok-123".to_string()));
    }

    #[test]
    fn test_save_overwrites_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save("old").unwrap();
        store.save("new").unwrap();
        assert_eq!(store.load(), Some("new".to_string()));
    }

    #[test]
    fn test_corrupt_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_empty_token_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        fs::write(store.path(), r#"{"authenticationToken":""}"#).unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save("tok").unwrap();
        store.clear();
        assert_eq!(store.load(), None);

        // Second clear on an absent file must not fail.
        store.clear();
    }

    #[test]
    fn test_saved_file_carries_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save("tok").unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["authenticationToken"], "tok");
        assert!(value["savedAt"].as_str().is_some());
    }
}
