//! Store adapters for the backends cryptkv supports: an in-process map for
//! tests, a session-oriented hierarchical store (ZooKeeper style), the
//! Consul HTTP KV API and the etcd v3 JSON gateway.

pub mod consul;
pub mod etcd;
pub mod memory;
pub mod options;
pub mod zookeeper;

pub use consul::ConsulStore;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use options::WatchOptions;
pub use zookeeper::{
    Credentials, SessionClient, SessionConnector, SessionError, SessionRegistry,
    SimulatedEnsemble, ZookeeperStore,
};
