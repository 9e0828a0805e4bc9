//! Session-oriented hierarchical store adapter (ZooKeeper style).
//!
//! Writes and deletes follow a read-version-then-conditional-mutate protocol.
//! A conditional mutation that loses a race surfaces
//! [`StoreError::VersionConflict`]; it is never retried or applied blindly.
//!
//! All handles built for one ensemble through a [`SessionRegistry`] share a
//! single session. Every backend failure is copied to that session's recovery
//! loop, which re-establishes the session and re-applies credentials after an
//! expiry. Re-authentication excludes data-path calls, and calls issued while
//! the session is being recovered wait for it.

mod connection;
pub mod session;
pub mod simulated;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use cryptkv_core::{
    path, watch_channel, CancellationToken, KvPair, KvPairs, Logger, Notifier, Response, Store,
    StoreError, WatchStream,
};
use tracing::{instrument, Level};

use self::connection::Connection;
pub use self::connection::{Credentials, SessionRegistry, DEFAULT_CONNECT_TIMEOUT};
pub use self::session::{
    EventKind, EventReceiver, NodeEvent, SessionClient, SessionConnector, SessionError, Stat,
    Version,
};
pub use self::simulated::{SimulatedEnsemble, SimulatedSession};

const NAME: &str = "zookeeper";
const DEFAULT_WATCH_RETRY: Duration = Duration::from_secs(5);

/// Store adapter over a shared coordination session.
#[derive(Clone)]
pub struct ZookeeperStore {
    conn: Arc<Connection>,
    watch_retry: Duration,
}

impl ZookeeperStore {
    /// Connect through `registry`, reusing its live session for `machines` if
    /// one exists.
    pub async fn connect(
        registry: &SessionRegistry,
        machines: &[String],
        credentials: Option<Credentials>,
    ) -> Result<Self, StoreError> {
        let conn = registry
            .connection(machines, credentials)
            .await
            .map_err(|e| StoreError::backend(NAME, format!("connect: {e}")))?;
        Ok(Self {
            conn,
            watch_retry: DEFAULT_WATCH_RETRY,
        })
    }

    /// Delay before a watch re-arms after a failed read.
    pub fn with_watch_retry(mut self, delay: Duration) -> Self {
        self.watch_retry = delay;
        self
    }

    /// Log, report to the recovery loop, and wrap a failed call.
    fn fail(&self, op: &str, key: &str, err: SessionError, generation: u64) -> StoreError {
        self.conn.report(&err, generation);
        self.conn.logger.log(
            Level::DEBUG,
            &format!("{NAME}: {op} {key} failed: {err}"),
        );
        StoreError::backend(NAME, format!("{op} {key}: {err}"))
    }

    /// Run `op` again once if it failed only because the session expired; the
    /// second attempt waits for the recovery loop first.
    async fn retry_expired<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt>>,
    {
        match op().await {
            Err(Attempt::Expired(_)) => op().await.map_err(Attempt::into_error),
            other => other.map_err(Attempt::into_error),
        }
    }

    async fn get_once(&self, key: &str) -> Result<Vec<u8>, Attempt> {
        let session = self.session("get", key).await?;
        match session.get(key).await {
            Ok((data, _)) => Ok(data),
            Err(SessionError::NoNode) => Err(StoreError::not_found(NAME, key).into()),
            Err(err) => Err(self.attempt_failed("get", key, err, session.generation)),
        }
    }

    async fn list_once(&self, key: &str) -> Result<KvPairs, Attempt> {
        let root = path::clean(key);
        let session = self.session("list", &root).await?;
        let generation = session.generation;
        let mut pending = match session.children(&root).await {
            Ok(children) => children
                .into_iter()
                .map(|child| path::join(&root, &child))
                .collect::<Vec<_>>(),
            Err(SessionError::NoNode) => return Ok(Vec::new()),
            Err(err) => return Err(self.attempt_failed("list", &root, err, generation)),
        };

        let mut pairs = Vec::new();
        while let Some(node) = pending.pop() {
            match session.get(&node).await {
                Ok((data, stat)) => {
                    if stat.num_children > 0 {
                        match session.children(&node).await {
                            Ok(children) => pending
                                .extend(children.into_iter().map(|c| path::join(&node, &c))),
                            Err(SessionError::NoNode) => {}
                            Err(err) => {
                                return Err(self.attempt_failed("list", &node, err, generation))
                            }
                        }
                        // Parents created by `set` carry no value of their own.
                        if data.is_empty() {
                            continue;
                        }
                    }
                    pairs.push(KvPair::new(node, data));
                }
                // Removed between listing and reading.
                Err(SessionError::NoNode) => {}
                Err(err) => return Err(self.attempt_failed("list", &node, err, generation)),
            }
        }
        Ok(pairs)
    }

    async fn set_once(&self, key: &str, value: &[u8]) -> Result<(), Attempt> {
        let session = self.session("set", key).await?;
        match session.get(key).await {
            Ok((_, stat)) => match session.set(key, value, stat.version).await {
                Ok(_) => Ok(()),
                Err(SessionError::BadVersion | SessionError::NoNode) => {
                    Err(StoreError::version_conflict(NAME, key).into())
                }
                Err(err) => Err(self.attempt_failed("set", key, err, session.generation)),
            },
            Err(SessionError::NoNode) => {
                self.create(&*session, session.generation, key, value).await
            }
            Err(err) => Err(self.attempt_failed("set", key, err, session.generation)),
        }
    }

    /// Create `key`, creating missing ancestors with empty data first.
    async fn create(
        &self,
        session: &dyn SessionClient,
        generation: u64,
        key: &str,
        value: &[u8],
    ) -> Result<(), Attempt> {
        match session.create(key, value).await {
            Ok(_) => return Ok(()),
            Err(SessionError::NodeExists) => {
                return Err(StoreError::version_conflict(NAME, key).into())
            }
            Err(SessionError::NoNode) => {}
            Err(err) => return Err(self.attempt_failed("set", key, err, generation)),
        }

        for ancestor in ancestors(key) {
            match session.create(&ancestor, &[]).await {
                Ok(_) | Err(SessionError::NodeExists) => {}
                Err(err) => return Err(self.attempt_failed("set", &ancestor, err, generation)),
            }
        }
        match session.create(key, value).await {
            Ok(_) => Ok(()),
            Err(SessionError::NodeExists) => Err(StoreError::version_conflict(NAME, key).into()),
            Err(err) => Err(self.attempt_failed("set", key, err, generation)),
        }
    }

    async fn delete_once(&self, key: &str) -> Result<(), Attempt> {
        let session = self.session("delete", key).await?;
        let stat = match session.get(key).await {
            Ok((_, stat)) => stat,
            Err(SessionError::NoNode) => return Ok(()),
            Err(err) => return Err(self.attempt_failed("delete", key, err, session.generation)),
        };
        match session.delete(key, stat.version).await {
            Ok(()) | Err(SessionError::NoNode) => Ok(()),
            Err(SessionError::BadVersion) => Err(StoreError::version_conflict(NAME, key).into()),
            Err(err) => Err(self.attempt_failed("delete", key, err, session.generation)),
        }
    }

    async fn session(
        &self,
        op: &str,
        key: &str,
    ) -> Result<connection::SessionGuard<'_>, Attempt> {
        self.conn
            .session()
            .await
            .map_err(|err| self.attempt_failed(op, key, err, self.conn.generation()))
    }

    fn attempt_failed(&self, op: &str, key: &str, err: SessionError, generation: u64) -> Attempt {
        let expired = err == SessionError::SessionExpired;
        let wrapped = self.fail(op, key, err, generation);
        if expired {
            Attempt::Expired(wrapped)
        } else {
            Attempt::Failed(wrapped)
        }
    }
}

/// Outcome of one attempt; expiry is kept apart so the caller can retry once.
enum Attempt {
    Expired(StoreError),
    Failed(StoreError),
}

impl Attempt {
    fn into_error(self) -> StoreError {
        match self {
            Attempt::Expired(err) | Attempt::Failed(err) => err,
        }
    }
}

impl From<StoreError> for Attempt {
    fn from(err: StoreError) -> Self {
        Attempt::Failed(err)
    }
}

/// Proper ancestors of `key`, outermost first, excluding the root.
fn ancestors(key: &str) -> Vec<String> {
    let cleaned = path::clean(key);
    let mut out = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = cleaned.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

#[async_trait]
impl Store for ZookeeperStore {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.retry_expired(move || self.get_once(key)).await
    }

    /// Every node below `key`, including intermediate nodes, keyed by full path.
    #[instrument(skip_all, fields(key = %key))]
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        self.retry_expired(move || self.list_once(key)).await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.retry_expired(move || self.set_once(key, value)).await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.retry_expired(move || self.delete_once(key)).await
    }

    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream {
        let (notifier, stream) = watch_channel(stop);
        tokio::spawn(watch_node(self.clone(), key.to_string(), notifier));
        stream
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.conn.client().set_logger(Arc::clone(&logger));
        self.conn.logger.replace(logger);
    }
}

/// A one-shot watch together with the session generation it was left on.
struct Armed {
    events: EventReceiver,
    generation: u64,
}

/// Read `key` and leave a one-shot watch on it. A missing node is watched for
/// creation instead. `None` means no watch could be armed.
async fn arm(store: &ZookeeperStore, key: &str) -> (Response, Option<Armed>) {
    let session = match store.conn.session().await {
        Ok(session) => session,
        Err(err) => {
            let generation = store.conn.generation();
            return (Err(store.fail("watch", key, err, generation)), None);
        }
    };
    let generation = session.generation;
    let armed = |events| Some(Armed { events, generation });
    match session.get_w(key).await {
        Ok((data, _, events)) => (Ok(data), armed(events)),
        Err(SessionError::NoNode) => match session.exists_w(key).await {
            Ok((None, events)) => (Err(StoreError::not_found(NAME, key)), armed(events)),
            // Created between the two calls; the existence watch still covers it.
            Ok((Some(_), events)) => match session.get(key).await {
                Ok((data, _)) => (Ok(data), armed(events)),
                Err(SessionError::NoNode) => (Err(StoreError::not_found(NAME, key)), armed(events)),
                Err(err) => (Err(store.fail("watch", key, err, generation)), armed(events)),
            },
            Err(err) => (Err(store.fail("watch", key, err, generation)), None),
        },
        Err(err) => (Err(store.fail("watch", key, err, generation)), None),
    }
}

/// Per-call watch task: push the current value, then one notification per
/// node event. Session events push an error and wait for the shared recovery
/// loop before re-reading. Stopping releases only this watch.
async fn watch_node(store: ZookeeperStore, key: String, notifier: Notifier) {
    let (initial, mut armed) = arm(&store, &key).await;
    if !notifier.send(initial).await {
        return;
    }

    loop {
        let (event, generation) = match armed.take() {
            Some(Armed { events, generation }) => tokio::select! {
                biased;
                _ = notifier.stopped() => break,
                event = events => (event.ok(), generation),
            },
            None => {
                // Last read failed; back off before trying again.
                if !notifier.sleep(store.watch_retry).await {
                    break;
                }
                (None, store.conn.generation())
            }
        };

        match event {
            Some(NodeEvent { err: None, kind, .. }) if kind != EventKind::Session => {}
            Some(NodeEvent { err, .. }) => {
                let err = err.unwrap_or(SessionError::ConnectionLoss);
                let wrapped = store.fail("watch", &key, err, generation);
                if !notifier.send(Err(wrapped)).await {
                    break;
                }
                if !wait_for_recovery(&store, &notifier).await {
                    break;
                }
            }
            None => {
                if !wait_for_recovery(&store, &notifier).await {
                    break;
                }
            }
        }

        let (response, rearmed) = arm(&store, &key).await;
        armed = rearmed;
        if !notifier.send(response).await {
            break;
        }
    }
    store
        .conn
        .logger
        .log(Level::DEBUG, &format!("{NAME}: watch {key} stopped"));
}

async fn wait_for_recovery(store: &ZookeeperStore, notifier: &Notifier) -> bool {
    tokio::select! {
        biased;
        _ = notifier.stopped() => false,
        // A timeout here surfaces on the next read instead.
        _ = store.conn.wait_ready() => true,
    }
}
