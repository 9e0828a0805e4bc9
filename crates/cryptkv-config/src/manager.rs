use std::{io::Read, sync::Arc};

use async_trait::async_trait;
use cryptkv_core::{
    watch_channel, CancellationToken, KvPair, KvPairs, Logger, Store, StoreError, WatchStream,
};
use cryptkv_secconf::KeyMaterial;
use tracing::instrument;

use crate::{
    codec::{Plaintext, Secconf, ValueCodec},
    error::ConfigError,
};

/// Application-facing configuration API. Same shapes as [`Store`], with values
/// transformed by the manager's codec.
#[async_trait]
pub trait ConfigManager: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Every entry below `key`. One undecodable value fails the whole call.
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Stream decoded values of `key` until `stop` fires.
    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream;

    fn set_logger(&self, logger: Arc<dyn Logger>);
}

/// A store plus the codec applied to every value crossing it.
pub struct Manager<C> {
    store: Arc<dyn Store>,
    codec: Arc<C>,
}

/// Values are stored as given.
pub type StandardConfigManager = Manager<Plaintext>;

/// Values are stored in the secconf envelope.
pub type EncryptedConfigManager = Manager<Secconf>;

impl<C: ValueCodec> Manager<C> {
    pub fn new(store: Arc<dyn Store>, codec: C) -> Self {
        Self {
            store,
            codec: Arc::new(codec),
        }
    }

    /// The underlying store, for callers that need raw access.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

impl Manager<Plaintext> {
    pub fn standard<S: Store + 'static>(store: S) -> Self {
        Self::new(Arc::new(store), Plaintext)
    }
}

impl Manager<Secconf> {
    /// Read the whole keystore from `keystore` once and keep it for the
    /// manager's lifetime.
    pub fn encrypted<S: Store + 'static, R: Read>(
        store: S,
        keystore: R,
    ) -> Result<Self, ConfigError> {
        let key = KeyMaterial::from_reader(keystore)?;
        Ok(Self::new(Arc::new(store), Secconf::new(key)))
    }
}

impl<C> Clone for Manager<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<C> std::fmt::Debug for Manager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("store", &self.store.name())
            .field("codec", &std::any::type_name::<C>())
            .finish()
    }
}

#[async_trait]
impl<C: ValueCodec> ConfigManager for Manager<C> {
    #[instrument(skip_all, fields(key = %key, backend = self.store.name()))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let stored = self.store.get(key).await?;
        self.codec.decode(stored)
    }

    #[instrument(skip_all, fields(key = %key, backend = self.store.name()))]
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        self.store
            .list(key)
            .await?
            .into_iter()
            .filter(|kv| !self.codec.is_placeholder(&kv.value))
            .map(|kv| {
                let value = self.codec.decode(kv.value)?;
                Ok(KvPair::new(kv.key, value))
            })
            .collect::<Result<KvPairs, StoreError>>()
    }

    #[instrument(skip_all, fields(key = %key, backend = self.store.name()))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let encoded = self.codec.encode(value)?;
        self.store.set(key, &encoded).await
    }

    #[instrument(skip_all, fields(key = %key, backend = self.store.name()))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream {
        let mut upstream = self.store.watch(key, stop.clone());
        let (notifier, stream) = watch_channel(stop);
        let codec = Arc::clone(&self.codec);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = notifier.stopped() => break,
                    next = upstream.recv() => next,
                };
                let Some(response) = next else {
                    break;
                };
                if !notifier.send(response.and_then(|v| codec.decode(v))).await {
                    break;
                }
            }
        });
        stream
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.store.set_logger(logger);
    }
}
