//! Persisted signature key pairs.
//!
//! The per-session MLS signature key is stored as a JWK so the same
//! identity survives voice reconnects. Files are written via a `.tmp`
//! sibling and an atomic rename, with owner-only permissions on Unix.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openmls_basic_credential::SignatureKeyPair;
use openmls_traits::types::SignatureScheme;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ClientError;

/// Directory under the platform config dir holding key files.
const STORAGE_DIR_NAME: &str = "Voxlock Key Storage";

/// An Ed25519 key pair in JWK form.
#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    kty: String,
    crv: String,
    /// Private key, base64url.
    d: String,
    /// Public key, base64url.
    x: String,
}

/// File-backed signature key storage.
pub struct KeyPairStore {
    directory: PathBuf,
}

impl KeyPairStore {
    /// Open the default platform store.
    ///
    /// The directory is `$XDG_CONFIG_HOME` (else `$HOME/.config`, else
    /// `%LOCALAPPDATA%`) joined with the storage directory name; it is
    /// created if missing.
    pub fn open_default() -> Result<Self, ClientError> {
        let base = config_dir()
            .ok_or_else(|| ClientError::KeyStorage("no config directory available".into()))?;
        Self::open(base.join(STORAGE_DIR_NAME))
    }

    /// Open a store rooted at an explicit directory.
    pub fn open(directory: PathBuf) -> Result<Self, ClientError> {
        fs::create_dir_all(&directory)
            .map_err(|e| ClientError::KeyStorage(format!("create {directory:?}: {e}")))?;
        Ok(Self { directory })
    }

    fn key_path(&self, session_id: &str) -> PathBuf {
        self.directory.join(format!("{session_id}.key"))
    }

    /// Load the key pair persisted for a session, if any.
    ///
    /// A corrupt file is treated as absent; the caller generates a fresh
    /// key and overwrites it.
    pub fn load(&self, session_id: &str) -> Option<SignatureKeyPair> {
        let path = self.key_path(session_id);
        let contents = fs::read_to_string(&path).ok()?;

        let stored: StoredKey = match serde_json::from_str(&contents) {
            Ok(stored) => stored,
            Err(error) => {
                warn!(?path, %error, "discarding corrupt key file");
                return None;
            },
        };
        if stored.kty != "OKP" || stored.crv != "Ed25519" {
            warn!(?path, "discarding key file with unexpected algorithm");
            return None;
        }

        let private = URL_SAFE_NO_PAD.decode(&stored.d).ok()?;
        let public = URL_SAFE_NO_PAD.decode(&stored.x).ok()?;

        debug!(session_id, "loaded persisted signature key");
        Some(SignatureKeyPair::from_raw(SignatureScheme::ED25519, private, public))
    }

    /// Persist a session's key pair: serialized as a JWK, written to a
    /// `.tmp` sibling, fsynced, then renamed into place.
    pub fn store(&self, session_id: &str, key_pair: &SignatureKeyPair) -> Result<(), ClientError> {
        let stored = StoredKey {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            d: URL_SAFE_NO_PAD.encode(key_pair.private()),
            x: URL_SAFE_NO_PAD.encode(key_pair.public()),
        };
        let contents = serde_json::to_string(&stored)
            .map_err(|e| ClientError::KeyStorage(format!("serialize key: {e}")))?;

        let path = self.key_path(session_id);
        let tmp_path = self.directory.join(format!("{session_id}.key.tmp"));

        write_private(&tmp_path, contents.as_bytes())
            .map_err(|e| ClientError::KeyStorage(format!("write {tmp_path:?}: {e}")))?;
        fs::rename(&tmp_path, &path)
            .map_err(|e| ClientError::KeyStorage(format!("rename into {path:?}: {e}")))?;

        debug!(session_id, "persisted signature key");
        Ok(())
    }

    /// Remove a session's persisted key.
    pub fn remove(&self, session_id: &str) {
        let _ = fs::remove_file(self.key_path(session_id));
    }
}

/// Write a file readable only by its owner.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Platform configuration directory.
fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home).join(".config"));
        }
    }
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        if !local.is_empty() {
            return Some(PathBuf::from(local));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> KeyPairStore {
        let directory = std::env::temp_dir().join(format!("voxlock-key-store-{name}"));
        let _ = fs::remove_dir_all(&directory);
        KeyPairStore::open(directory).unwrap()
    }

    fn key_pair() -> SignatureKeyPair {
        SignatureKeyPair::new(SignatureScheme::ED25519).unwrap()
    }

    #[test]
    fn roundtrip_preserves_key_material() {
        let store = temp_store("roundtrip");
        let original = key_pair();

        store.store("session-1", &original).unwrap();
        let loaded = store.load("session-1").expect("key loads back");

        assert_eq!(loaded.public(), original.public());
        assert_eq!(loaded.private(), original.private());
    }

    #[test]
    fn missing_key_is_none() {
        let store = temp_store("missing");
        assert!(store.load("nope").is_none());
    }

    #[test]
    fn corrupt_file_is_treated_as_absent() {
        let store = temp_store("corrupt");
        fs::write(store.key_path("session-1"), b"not json").unwrap();
        assert!(store.load("session-1").is_none());
    }

    #[test]
    fn stored_file_is_jwk() {
        let store = temp_store("jwk");
        store.store("session-1", &key_pair()).unwrap();

        let contents = fs::read_to_string(store.key_path("session-1")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["kty"], "OKP");
        assert_eq!(value["crv"], "Ed25519");
        assert!(value["d"].is_string());
        assert!(value["x"].is_string());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let store = temp_store("tmp");
        store.store("session-1", &key_pair()).unwrap();
        assert!(!store.directory.join("session-1.key.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let store = temp_store("perms");
        store.store("session-1", &key_pair()).unwrap();

        let permissions =
            fs::metadata(store.key_path("session-1")).unwrap().permissions();
        assert_eq!(permissions.mode() & 0o777, 0o600);
    }

    #[test]
    fn remove_deletes_key() {
        let store = temp_store("remove");
        store.store("session-1", &key_pair()).unwrap();
        store.remove("session-1");
        assert!(store.load("session-1").is_none());
    }
}
