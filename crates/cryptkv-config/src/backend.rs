use std::sync::Arc;

use async_trait::async_trait;
use cryptkv_backend::{
    ConsulStore, Credentials, EtcdStore, MemoryStore, SessionRegistry, ZookeeperStore,
};
use cryptkv_core::{CancellationToken, KvPairs, Logger, Store, StoreError, WatchStream};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// One of the supported store adapters.
#[derive(Clone)]
pub enum Backend {
    Memory(MemoryStore),
    Zookeeper(ZookeeperStore),
    Consul(ConsulStore),
    Etcd(EtcdStore),
}

impl Backend {
    fn store(&self) -> &dyn Store {
        match self {
            Backend::Memory(store) => store,
            Backend::Zookeeper(store) => store,
            Backend::Consul(store) => store,
            Backend::Etcd(store) => store,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.store().name()).finish()
    }
}

impl From<MemoryStore> for Backend {
    fn from(store: MemoryStore) -> Self {
        Backend::Memory(store)
    }
}

impl From<ZookeeperStore> for Backend {
    fn from(store: ZookeeperStore) -> Self {
        Backend::Zookeeper(store)
    }
}

impl From<ConsulStore> for Backend {
    fn from(store: ConsulStore) -> Self {
        Backend::Consul(store)
    }
}

impl From<EtcdStore> for Backend {
    fn from(store: EtcdStore) -> Self {
        Backend::Etcd(store)
    }
}

#[async_trait]
impl Store for Backend {
    fn name(&self) -> &'static str {
        self.store().name()
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.store().get(key).await
    }

    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        self.store().list(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.store().set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store().delete(key).await
    }

    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream {
        self.store().watch(key, stop)
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.store().set_logger(logger)
    }
}

/// Serializable description of a backend, tagged by `kind`:
///
/// ```toml
/// kind = "consul"
/// endpoint = "http://127.0.0.1:8500"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory {
        /// Use the process-wide map instead of a private one.
        #[serde(default = "shared_by_default")]
        shared: bool,
    },
    Zookeeper {
        machines: Vec<String>,
        #[serde(default)]
        user: String,
        #[serde(default)]
        password: String,
    },
    Consul {
        endpoint: String,
        #[serde(default)]
        token: Option<String>,
    },
    Etcd {
        machines: Vec<String>,
        #[serde(default)]
        user: String,
        #[serde(default)]
        password: String,
    },
}

fn shared_by_default() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory {
            shared: shared_by_default(),
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory { .. } => "memory",
            BackendConfig::Zookeeper { .. } => "zookeeper",
            BackendConfig::Consul { .. } => "consul",
            BackendConfig::Etcd { .. } => "etcd",
        }
    }

    /// Build the described backend. Zookeeper sessions are taken from
    /// `registry`, which must have a connector.
    pub async fn open(&self, registry: &SessionRegistry) -> Result<Backend, ConfigError> {
        let backend = match self {
            BackendConfig::Memory { shared: true } => Backend::Memory(MemoryStore::shared()),
            BackendConfig::Memory { shared: false } => Backend::Memory(MemoryStore::new()),
            BackendConfig::Zookeeper {
                machines,
                user,
                password,
            } => {
                if machines.iter().all(|m| m.trim().is_empty()) {
                    return Err(ConfigError::Invalid("zookeeper: no machines".into()));
                }
                if !registry.has_connector() {
                    return Err(ConfigError::MissingConnector);
                }
                let credentials =
                    (!user.is_empty()).then(|| Credentials::new(user.clone(), password.clone()));
                Backend::Zookeeper(ZookeeperStore::connect(registry, machines, credentials).await?)
            }
            BackendConfig::Consul { endpoint, token } => {
                if endpoint.trim().is_empty() {
                    return Err(ConfigError::Invalid("consul: empty endpoint".into()));
                }
                Backend::Consul(ConsulStore::new(endpoint.trim(), token.clone()))
            }
            BackendConfig::Etcd {
                machines,
                user,
                password,
            } => {
                let credentials =
                    (!user.is_empty()).then(|| Credentials::new(user.clone(), password.clone()));
                Backend::Etcd(EtcdStore::new(machines, credentials)?)
            }
        };
        info!(backend = self.kind(), "backend ready");
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use cryptkv_backend::SimulatedEnsemble;

    use super::*;

    #[test]
    fn parses_tagged_toml() {
        let cfg: BackendConfig = toml::from_str(
            r#"
            kind = "zookeeper"
            machines = ["zk1:2181", "zk2:2181"]
            user = "app"
            password = "pw"
            "#,
        )
        .expect("parse");
        assert_eq!(
            cfg,
            BackendConfig::Zookeeper {
                machines: vec!["zk1:2181".into(), "zk2:2181".into()],
                user: "app".into(),
                password: "pw".into(),
            }
        );

        let cfg: BackendConfig = toml::from_str(r#"kind = "memory""#).expect("parse");
        assert_eq!(cfg, BackendConfig::default());

        let cfg: BackendConfig =
            toml::from_str("kind = \"memory\"\nshared = false").expect("parse");
        assert_eq!(cfg, BackendConfig::Memory { shared: false });
    }

    #[tokio::test]
    async fn opens_each_kind() {
        let ensemble = SimulatedEnsemble::new();
        let registry = SessionRegistry::new(Arc::new(ensemble));

        let memory = BackendConfig::Memory { shared: false }
            .open(&registry)
            .await
            .expect("memory");
        assert_eq!(memory.name(), "memory");

        let zk = BackendConfig::Zookeeper {
            machines: vec!["zk1:2181".into()],
            user: String::new(),
            password: String::new(),
        }
        .open(&registry)
        .await
        .expect("zookeeper");
        zk.set("/opened", b"yes").await.expect("set");
        assert_eq!(zk.get("/opened").await.expect("get"), b"yes");

        let consul = BackendConfig::Consul {
            endpoint: "http://127.0.0.1:8500".into(),
            token: None,
        }
        .open(&registry)
        .await
        .expect("consul");
        assert_eq!(format!("{consul:?}"), r#"Backend("consul")"#);

        let etcd = BackendConfig::Etcd {
            machines: vec!["http://127.0.0.1:2379".into()],
            user: "app".into(),
            password: "pw".into(),
        }
        .open(&registry)
        .await
        .expect("etcd");
        assert_eq!(etcd.name(), "etcd");
    }

    #[test]
    fn parses_etcd_with_optional_credentials() {
        let cfg: BackendConfig = toml::from_str(
            r#"
            kind = "etcd"
            machines = ["http://etcd1:2379"]
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.kind(), "etcd");
        assert_eq!(
            cfg,
            BackendConfig::Etcd {
                machines: vec!["http://etcd1:2379".into()],
                user: String::new(),
                password: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn etcd_needs_machines() {
        let registry = SessionRegistry::without_connector();
        let err = BackendConfig::Etcd {
            machines: Vec::new(),
            user: String::new(),
            password: String::new(),
        }
        .open(&registry)
        .await
        .expect_err("no machines");
        assert_eq!(err.to_string(), "etcd: no machines");
    }

    #[tokio::test]
    async fn zookeeper_needs_connector_and_machines() {
        let registry = SessionRegistry::without_connector();
        let err = BackendConfig::Zookeeper {
            machines: vec!["zk1:2181".into()],
            user: String::new(),
            password: String::new(),
        }
        .open(&registry)
        .await
        .expect_err("no connector");
        assert!(matches!(err, ConfigError::MissingConnector));

        let err = BackendConfig::Zookeeper {
            machines: vec![" ".into()],
            user: String::new(),
            password: String::new(),
        }
        .open(&registry)
        .await
        .expect_err("no machines");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
