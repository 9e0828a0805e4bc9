use cryptkv_core::StoreError;
use cryptkv_secconf::KeyError;
use thiserror::Error;

/// Failures building a manager. Data-path calls report [`StoreError`] instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("keystore: {0}")]
    Keystore(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("zookeeper backend requires a session connector")]
    MissingConnector,
    #[error("invalid backend configuration: {0}")]
    Invalid(String),
}
