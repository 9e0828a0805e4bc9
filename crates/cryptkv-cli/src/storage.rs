use std::sync::Arc;

use color_eyre::Result;
use cryptkv_backend::SessionRegistry;
use cryptkv_config::{encrypted_manager, standard_manager, ConfigManager};
use cryptkv_secconf::{FileKeyProvider, KeyMaterial, KeyProvider, KeyringProvider};
use tracing::debug;

use crate::config::{Config, KeySource};

/// Resolve key material from the configured source.
pub async fn key_material(keys: &KeySource) -> Result<KeyMaterial> {
    let material = match keys {
        KeySource::Keyring { service, account } => {
            debug!(%service, %account, "loading key material from keyring");
            KeyringProvider::new(service.clone(), account.clone())
                .load()
                .await?
        }
        KeySource::File { path } => {
            debug!(?path, "loading key material from keystore file");
            FileKeyProvider::new(path.clone()).load().await?
        }
    };
    Ok(material)
}

/// Build the manager the config asks for. The binary ships no ZooKeeper
/// client, so a zookeeper backend in the config is reported as unsupported.
pub async fn manager_from_config(config: &Config) -> Result<Arc<dyn ConfigManager>> {
    let registry = SessionRegistry::without_connector();
    if config.plaintext {
        let manager = standard_manager(&config.backend, &registry).await?;
        return Ok(Arc::new(manager));
    }
    let key = key_material(&config.keys).await?;
    let manager = encrypted_manager(&config.backend, &registry, key.as_bytes()).await?;
    Ok(Arc::new(manager))
}
