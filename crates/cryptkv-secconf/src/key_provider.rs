use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::key_material::KeyMaterial;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("keystore io error: {0}")]
    Io(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Provides the key material a manager is constructed with
/// (keystore file or OS keychain in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn load(&self) -> Result<KeyMaterial, KeyError>;
}

/// Reads key material from a keystore file.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KeyProvider for FileKeyProvider {
    async fn load(&self) -> Result<KeyMaterial, KeyError> {
        debug!(path = ?self.path, "reading keystore");
        let file = fs::File::open(&self.path)
            .map_err(|e| KeyError::Io(format!("{}: {e}", self.path.display())))?;
        KeyMaterial::from_reader(file)
    }
}

/// OS keyring-backed provider. Uses the `keyring` crate to store the keystore
/// blob, generating one on first use.
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    async fn load(&self) -> Result<KeyMaterial, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        let entry = keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;

        if let Some(existing) = stored_material(entry.get_password())? {
            return Ok(existing);
        }

        debug!(service = %self.service, account = %self.account, "creating keyring entry");
        let material = KeyMaterial::generate();
        let blob = std::str::from_utf8(material.as_bytes())
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        entry
            .set_password(blob)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;
        Ok(material)
    }
}

/// Only a missing entry may be replaced with a fresh key; any other keychain
/// failure is reported so existing ciphertext stays readable.
fn stored_material(
    stored: Result<String, keyring::Error>,
) -> Result<Option<KeyMaterial>, KeyError> {
    match stored {
        Ok(secret) => Ok(Some(KeyMaterial::from_bytes(secret))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(KeyError::Keyring(err.to_string())),
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    pub fn with_material(material: KeyMaterial) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(material))),
        }
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn load(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = KeyMaterial::generate();
        *guard = Some(material.clone());
        Ok(material)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::default();
        let first = provider.load().await.unwrap();
        let second = provider.load().await.unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn keyring_entry_is_created_only_when_missing() {
        let material = KeyMaterial::generate();
        let secret = String::from_utf8(material.as_bytes().to_vec()).expect("base64 is utf-8");
        assert_eq!(
            stored_material(Ok(secret)).expect("stored"),
            Some(material)
        );
        assert_eq!(
            stored_material(Err(keyring::Error::NoEntry)).expect("missing"),
            None
        );

        let locked = keyring::Error::PlatformFailure(Box::new(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "keychain locked",
        )));
        let err = stored_material(Err(locked)).expect_err("platform failure");
        assert!(matches!(err, KeyError::Keyring(ref msg) if msg.contains("keychain locked")));
    }

    #[tokio::test]
    async fn file_provider_reads_keystore() {
        let material = KeyMaterial::generate();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(material.as_bytes()).expect("write keystore");

        let loaded = FileKeyProvider::new(file.path())
            .load()
            .await
            .expect("load");
        assert_eq!(loaded, material);
    }

    #[tokio::test]
    async fn file_provider_reports_missing_keystore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileKeyProvider::new(dir.path().join("absent.key"))
            .load()
            .await
            .expect_err("missing file");
        assert!(matches!(err, KeyError::Io(_)));
    }
}
