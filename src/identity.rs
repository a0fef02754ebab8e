//! Secret Store: on-disk, owner-read-only persistence of
//! `{drone_uuid, secret_key, created_at}`.
//!
//! The store never caches; the Session Manager is the one that keeps the
//! loaded secret in memory for the process lifetime.

use crate::error::IdentityError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub drone_uuid: String,
    pub secret_key: String,
    pub created_at: u64,
}

pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    /// Fixed path used outside test mode.
    pub fn fixed() -> Self {
        Self { path: PathBuf::from(".drone_secret") }
    }

    /// Test-mode path, isolated per UUID per §4.9 step 2.
    pub fn for_test_mode(uuid: &str) -> Self {
        let dir = std::env::temp_dir().join("drone-edge-agent-test");
        Self { path: dir.join(format!(".drone_secret.{uuid}")) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<SecretRecord, IdentityError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|_| IdentityError::NotRegistered(self.path.display().to_string()))?;
        let record: SecretRecord = serde_json::from_str(&text)
            .map_err(|_| IdentityError::Malformed(self.path.display().to_string()))?;
        if record.drone_uuid.is_empty() || record.secret_key.is_empty() {
            return Err(IdentityError::NotRegistered(self.path.display().to_string()));
        }
        Ok(record)
    }

    /// Atomic owner-only-permission write: write to a temp sibling file,
    /// `chmod 0600`, then rename over the target.
    pub fn save(&self, record: &SecretRecord) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string(record)?;
        std::fs::write(&tmp_path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated_store() -> SecretStore {
        let dir = std::env::temp_dir().join(format!("secret-store-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        SecretStore { path: dir.join(".drone_secret") }
    }

    #[test]
    fn load_without_file_is_not_registered() {
        let store = isolated_store();
        assert!(matches!(store.load(), Err(IdentityError::NotRegistered(_))));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let store = isolated_store();
        let record = SecretRecord {
            drone_uuid: "00000001-0000-0000-0000-000000000001".into(),
            secret_key: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
            created_at: 1_700_000_000,
        };
        store.save(&record).expect("save should succeed");

        let loaded = store.load().expect("load should succeed");
        assert_eq!(loaded.drone_uuid, record.drone_uuid);
        assert_eq!(loaded.secret_key, record.secret_key);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let store = isolated_store();
        let record = SecretRecord {
            drone_uuid: "00000001-0000-0000-0000-000000000001".into(),
            secret_key: "secret".into(),
            created_at: 0,
        };
        store.save(&record).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn empty_fields_are_treated_as_not_registered() {
        let store = isolated_store();
        std::fs::write(store.path(), r#"{"drone_uuid":"","secret_key":"","created_at":0}"#).unwrap();
        assert!(matches!(store.load(), Err(IdentityError::NotRegistered(_))));
    }
}
