//! Shared session handle, its recovery loop, and the registry that hands out
//! one connection per ensemble.

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use cryptkv_core::logger::LoggerSlot;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, Level};

use super::session::{SessionClient, SessionConnector, SessionError};

/// Reference connect timeout for new sessions.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_CHANNEL_CAPACITY: usize = 16;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Digest credentials re-applied after every session loss.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// `user:password`, or `None` when either half is empty.
    fn digest(&self) -> Option<Vec<u8>> {
        if self.user.is_empty() || self.password.is_empty() {
            return None;
        }
        Some(format!("{}:{}", self.user, self.password).into_bytes())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Connected,
    Expired,
    Recovering,
}

/// One session shared by every `ZookeeperStore` handle built for an ensemble.
pub(crate) struct Connection {
    client: Arc<dyn SessionClient>,
    credentials: Option<Credentials>,
    /// Data-path calls hold it shared; re-authentication holds it exclusively.
    gate: RwLock<()>,
    state: watch::Sender<SessionState>,
    /// Bumped every time the session is re-established.
    generation: AtomicU64,
    errors: mpsc::Sender<SessionError>,
    pub(crate) logger: LoggerSlot,
    pub(crate) connect_timeout: Duration,
}

/// A client borrowed for the duration of one call.
pub(crate) struct SessionGuard<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    client: &'a (dyn SessionClient + 'static),
    /// Session generation the call runs against.
    pub(crate) generation: u64,
}

impl Deref for SessionGuard<'_> {
    type Target = dyn SessionClient;

    fn deref(&self) -> &Self::Target {
        self.client
    }
}

impl Connection {
    /// Authenticate `client` and start the recovery loop for it.
    pub(crate) async fn establish(
        client: Arc<dyn SessionClient>,
        credentials: Option<Credentials>,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>, SessionError> {
        let (errors, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SessionState::Connected);
        let conn = Arc::new(Self {
            client,
            credentials,
            gate: RwLock::new(()),
            state,
            generation: AtomicU64::new(0),
            errors,
            logger: LoggerSlot::default(),
            connect_timeout,
        });
        conn.add_auth().await?;
        tokio::spawn(recovery_loop(Arc::downgrade(&conn), errors_rx));
        Ok(conn)
    }

    pub(crate) fn client(&self) -> &Arc<dyn SessionClient> {
        &self.client
    }

    /// Wait until the session is usable, then borrow the client.
    pub(crate) async fn session(&self) -> Result<SessionGuard<'_>, SessionError> {
        self.wait_ready().await?;
        let gate = self.gate.read().await;
        Ok(SessionGuard {
            _gate: gate,
            client: self.client.as_ref(),
            generation: self.generation(),
        })
    }

    /// Resolves once the recovery loop reports the session usable, bounded by
    /// the connect timeout.
    pub(crate) async fn wait_ready(&self) -> Result<(), SessionError> {
        let mut rx = self.state.subscribe();
        let outcome = match tokio::time::timeout(
            self.connect_timeout,
            rx.wait_for(|state| *state == SessionState::Connected),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SessionError::ConnectionLoss),
            Err(_) => Err(SessionError::Other(format!(
                "session not re-established within {:?}",
                self.connect_timeout
            ))),
        };
        outcome
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Hand a copy of a backend failure to the recovery loop. Never blocks.
    ///
    /// An expiry only marks the session for recovery when it was observed on
    /// the current `generation`; expiries seen on an already replaced session
    /// are stale.
    pub(crate) fn report(&self, err: &SessionError, generation: u64) {
        if *err == SessionError::SessionExpired && generation == self.generation() {
            self.state.send_if_modified(|state| {
                if *state == SessionState::Connected {
                    *state = SessionState::Expired;
                    true
                } else {
                    false
                }
            });
        }
        if self.errors.try_send(err.clone()).is_err() {
            debug!(error = %err, "zookeeper error channel full; dropping copy");
        }
    }

    fn needs_recovery(&self) -> bool {
        *self.state.borrow() != SessionState::Connected
    }

    async fn add_auth(&self) -> Result<(), SessionError> {
        if let Some(auth) = self.credentials.as_ref().and_then(Credentials::digest) {
            self.client.add_auth("digest", &auth).await?;
        }
        Ok(())
    }

    async fn reestablish(&self) -> Result<(), SessionError> {
        let _gate = self.gate.write().await;
        self.state.send_replace(SessionState::Recovering);
        self.client.reconnect().await?;
        self.add_auth().await?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(SessionState::Connected);
        Ok(())
    }
}

/// Consumes the error-observation channel for one connection. Exits once every
/// handle on the connection is gone.
async fn recovery_loop(conn: Weak<Connection>, mut errors: mpsc::Receiver<SessionError>) {
    while let Some(err) = errors.recv().await {
        let Some(live) = conn.upgrade() else {
            break;
        };
        live.logger
            .log(Level::DEBUG, &format!("zookeeper: observed error: {err}"));
        if !live.needs_recovery() {
            continue;
        }
        drop(live);
        if !reestablish(&conn).await {
            break;
        }
    }
    debug!("zookeeper recovery loop stopped");
}

async fn reestablish(conn: &Weak<Connection>) -> bool {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let Some(live) = conn.upgrade() else {
            return false;
        };
        match live.reestablish().await {
            Ok(()) => {
                live.logger.log(
                    Level::INFO,
                    &format!("zookeeper: session re-established after {attempt} attempt(s)"),
                );
                return true;
            }
            Err(err) => live.logger.log(
                Level::WARN,
                &format!("zookeeper: re-authentication attempt {attempt} failed: {err}"),
            ),
        }
        drop(live);
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

/// Hands out one shared connection per ensemble, opening it on first use.
pub struct SessionRegistry {
    connector: Option<Arc<dyn SessionConnector>>,
    connections: Mutex<HashMap<String, Weak<Connection>>>,
    connect_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector: Some(connector),
            connections: Mutex::new(HashMap::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// A registry that cannot open sessions (no client library wired in).
    pub fn without_connector() -> Self {
        Self {
            connector: None,
            connections: Mutex::new(HashMap::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn has_connector(&self) -> bool {
        self.connector.is_some()
    }

    /// Return the live connection for `machines`, or open and authenticate a
    /// new one. Credentials only apply when a new connection is opened.
    pub(crate) async fn connection(
        &self,
        machines: &[String],
        credentials: Option<Credentials>,
    ) -> Result<Arc<Connection>, SessionError> {
        let machines: Vec<String> = machines.iter().map(|m| m.trim().to_string()).collect();
        let ensemble_key = machines.join(",");

        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&ensemble_key).and_then(Weak::upgrade) {
            debug!(ensemble = %ensemble_key, "reusing zookeeper connection");
            return Ok(existing);
        }

        let connector = self.connector.as_ref().ok_or_else(|| {
            SessionError::Other("no session connector registered".to_string())
        })?;
        let client = connector.connect(&machines, self.connect_timeout).await?;
        let conn = Connection::establish(client, credentials, self.connect_timeout).await?;
        info!(ensemble = %ensemble_key, "zookeeper connection established");
        connections.insert(ensemble_key, Arc::downgrade(&conn));
        Ok(conn)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::without_connector()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("has_connector", &self.connector.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
