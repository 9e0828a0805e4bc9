//! Contract of the session-oriented coordination client the adapter drives.
//! The wire protocol lives behind these traits.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use cryptkv_core::Logger;
use thiserror::Error;
use tokio::sync::oneshot;

/// Node version used for optimistic concurrency.
pub type Version = i32;

/// Node metadata returned with reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub version: Version,
    pub num_children: i32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("node does not exist")]
    NoNode,
    #[error("node already exists")]
    NodeExists,
    #[error("node has children")]
    NotEmpty,
    #[error("version conflict")]
    BadVersion,
    #[error("not authenticated")]
    NoAuth,
    #[error("session has been expired by the server")]
    SessionExpired,
    #[error("connection lost")]
    ConnectionLoss,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The session the watch was registered on changed state.
    Session,
}

/// One-shot notification delivered to a registered watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: EventKind,
    pub path: String,
    pub err: Option<SessionError>,
}

impl NodeEvent {
    pub fn node(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            err: None,
        }
    }

    pub fn session(path: impl Into<String>, err: SessionError) -> Self {
        Self {
            kind: EventKind::Session,
            path: path.into(),
            err: Some(err),
        }
    }
}

/// Receiving end of a one-shot watch.
pub type EventReceiver = oneshot::Receiver<NodeEvent>;

/// A live session against the coordination ensemble.
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), SessionError>;

    /// Read a node and leave a one-shot watch for its next change.
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Stat, EventReceiver), SessionError>;

    /// Check for a node and leave a one-shot watch for its creation, change or removal.
    async fn exists_w(&self, path: &str) -> Result<(Option<Stat>, EventReceiver), SessionError>;

    /// Names (not paths) of the direct children of `path`.
    async fn children(&self, path: &str) -> Result<Vec<String>, SessionError>;

    async fn create(&self, path: &str, data: &[u8]) -> Result<String, SessionError>;

    /// Conditional update; fails with `BadVersion` when `version` is stale.
    async fn set(&self, path: &str, data: &[u8], version: Version) -> Result<Stat, SessionError>;

    /// Conditional delete; fails with `BadVersion` when `version` is stale.
    async fn delete(&self, path: &str, version: Version) -> Result<(), SessionError>;

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<(), SessionError>;

    /// Replace an expired session with a fresh one. Authentication is not kept.
    async fn reconnect(&self) -> Result<(), SessionError>;

    fn set_logger(&self, logger: Arc<dyn Logger>);
}

/// Opens sessions against an ensemble.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        machines: &[String],
        timeout: Duration,
    ) -> Result<Arc<dyn SessionClient>, SessionError>;
}
