use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use keyring::Entry;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task;
use tracing::debug;

use super::crypto;
use super::Session;

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "agrilink";

/// Keychain account holding the serialized session
const SESSION_ACCOUNT: &str = "session";

/// Keychain account holding the device secret for the session file
const DEVICE_SECRET_ACCOUNT: &str = "device-secret";

const DEVICE_SECRET_LEN: usize = 32;

/// Durable storage for the last established session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;

    async fn save(&self, session: &Session) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// File store
// ============================================================================

/// Session persisted as an encrypted file.
///
/// Key derivation and file I/O run on the blocking pool.
pub struct FileSessionStore {
    path: PathBuf,
    secret: Arc<[u8]>,
}

impl FileSessionStore {
    pub fn new(data_dir: &Path, secret: Vec<u8>) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
            secret: secret.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_sync(path: &Path, secret: &[u8]) -> Result<Option<Session>> {
        if !path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(path).context("Failed to read session file")?;
        let contents = crypto::open(secret, &sealed).context("Failed to decrypt session file")?;
        let session: Session =
            serde_json::from_slice(&contents).context("Failed to parse session file")?;
        debug!(path = ?path, user_id = %session.user_id, "Session file loaded");
        Ok(Some(session))
    }

    fn save_sync(path: &Path, secret: &[u8], session: &Session) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let contents = serde_json::to_vec(session)?;
        let sealed = crypto::seal(secret, &contents)?;

        // Write-then-rename so a crash never leaves a half-written file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, sealed).context("Failed to write session file")?;
        std::fs::rename(&tmp, path).context("Failed to replace session file")?;
        Ok(())
    }

    fn clear_sync(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        let path = self.path.clone();
        let secret = self.secret.clone();
        task::spawn_blocking(move || Self::load_sync(&path, &secret))
            .await
            .context("Session file task failed")?
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let path = self.path.clone();
        let secret = self.secret.clone();
        let session = session.clone();
        task::spawn_blocking(move || Self::save_sync(&path, &secret, &session))
            .await
            .context("Session file task failed")?
    }

    async fn clear(&self) -> Result<()> {
        let path = self.path.clone();
        task::spawn_blocking(move || Self::clear_sync(&path))
            .await
            .context("Session file task failed")?
    }
}

// ============================================================================
// Keychain store
// ============================================================================

/// Session persisted in the OS keychain.
pub struct KeyringSessionStore;

impl KeyringSessionStore {
    fn entry(account: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")
    }

    /// Get the device secret used to encrypt the session file, creating and
    /// storing a random one on first use.
    pub fn device_secret() -> Result<Vec<u8>> {
        let entry = Self::entry(DEVICE_SECRET_ACCOUNT)?;
        match entry.get_password() {
            Ok(encoded) => hex::decode(encoded.trim()).context("Stored device secret is corrupt"),
            Err(keyring::Error::NoEntry) => {
                let mut secret = vec![0u8; DEVICE_SECRET_LEN];
                OsRng.fill_bytes(&mut secret);
                entry
                    .set_password(&hex::encode(&secret))
                    .context("Failed to store device secret in keychain")?;
                debug!("Generated new device secret");
                Ok(secret)
            }
            Err(e) => Err(e).context("Failed to read device secret from keychain"),
        }
    }

    fn load_sync() -> Result<Option<Session>> {
        match Self::entry(SESSION_ACCOUNT)?.get_password() {
            Ok(contents) => {
                let session = serde_json::from_str(&contents)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn save_sync(contents: &str) -> Result<()> {
        Self::entry(SESSION_ACCOUNT)?
            .set_password(contents)
            .context("Failed to store session in keychain")
    }

    fn clear_sync() -> Result<()> {
        match Self::entry(SESSION_ACCOUNT)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

#[async_trait]
impl SessionStore for KeyringSessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        task::spawn_blocking(Self::load_sync)
            .await
            .context("Keychain task failed")?
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let contents = serde_json::to_string(session)?;
        task::spawn_blocking(move || Self::save_sync(&contents))
            .await
            .context("Keychain task failed")?
    }

    async fn clear(&self) -> Result<()> {
        task::spawn_blocking(Self::clear_sync)
            .await
            .context("Keychain task failed")?
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// Process-local store; nothing survives a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    /// Current stored value, without going through the async trait
    pub fn snapshot(&self) -> Option<Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.snapshot())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::test_session;

    #[tokio::test]
    async fn test_file_store_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(&dir.path().join("data"), b"secret".to_vec());

        assert_eq!(store.load().await.unwrap(), None);

        let session = test_session("u1", 60);
        store.save(&session).await.unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load().await.unwrap(), Some(session));

        store.clear().await.unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_is_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), b"secret".to_vec());
        store.save(&test_session("u1", 60)).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("access-u1"));

        let other = FileSessionStore::new(dir.path(), b"different".to_vec());
        assert!(other.load().await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), b"secret".to_vec());
        std::fs::write(store.path(), b"garbage").unwrap();

        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_overwrites_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), b"secret".to_vec());

        store.save(&test_session("u1", 60)).await.unwrap();
        let newer = test_session("u2", 60);
        store.save(&newer).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(newer));
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert_eq!(store.load().await.unwrap(), None);

        let session = test_session("u1", 60);
        store.save(&session).await.unwrap();
        assert_eq!(store.snapshot(), Some(session));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
