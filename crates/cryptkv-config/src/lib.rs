//! Configuration managers layered over the store adapters, plus the factory
//! that builds a backend from a serializable description.
//!
//! [`StandardConfigManager`] passes values through untouched;
//! [`EncryptedConfigManager`] keeps them in the secconf envelope at rest.

pub mod backend;
pub mod codec;
pub mod error;
pub mod manager;

use std::io::Read;

use cryptkv_backend::SessionRegistry;

pub use backend::{Backend, BackendConfig};
pub use codec::{Plaintext, Secconf, ValueCodec};
pub use cryptkv_core::{key_not_found, KvPair, KvPairs, Response, StoreError, WatchStream};
pub use error::ConfigError;
pub use manager::{ConfigManager, EncryptedConfigManager, Manager, StandardConfigManager};

/// Open the backend described by `config` and wrap it in a pass-through manager.
pub async fn standard_manager(
    config: &BackendConfig,
    registry: &SessionRegistry,
) -> Result<StandardConfigManager, ConfigError> {
    let backend = config.open(registry).await?;
    Ok(Manager::standard(backend))
}

/// Open the backend described by `config` and wrap it in an encrypting manager
/// using the key material read from `keystore`.
pub async fn encrypted_manager<R: Read>(
    config: &BackendConfig,
    registry: &SessionRegistry,
    keystore: R,
) -> Result<EncryptedConfigManager, ConfigError> {
    let backend = config.open(registry).await?;
    Manager::encrypted(backend, keystore)
}
