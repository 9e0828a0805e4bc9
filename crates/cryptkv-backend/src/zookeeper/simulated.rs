//! In-process ensemble implementing the session contract.
//!
//! Nodes are versioned, creates require an existing parent, watches are
//! one-shot, and sessions can be expired on demand to exercise recovery.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use cryptkv_core::{logger::LoggerSlot, path, Logger};
use tokio::sync::oneshot;
use tracing::Level;

use super::session::{
    EventKind, EventReceiver, NodeEvent, SessionClient, SessionConnector, SessionError, Stat,
    Version,
};

const ANY_VERSION: Version = -1;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: Version,
}

#[derive(Debug, Default)]
struct SessionState {
    expired: bool,
    auth: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
struct Watch {
    session: u64,
    tx: oneshot::Sender<NodeEvent>,
}

#[derive(Debug, Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<Watch>>,
    exist_watches: HashMap<String, Vec<Watch>>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
    required_auth: Option<(String, Vec<u8>)>,
    connects: usize,
    reconnects: usize,
    auths: usize,
}

/// Shared in-process ensemble. Cloning yields another handle on the same tree.
#[derive(Debug, Clone)]
pub struct SimulatedEnsemble {
    inner: Arc<Mutex<EnsembleState>>,
}

impl Default for SimulatedEnsemble {
    fn default() -> Self {
        let mut state = EnsembleState::default();
        state.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
            },
        );
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }
}

impl SimulatedEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every operation from sessions lacking this digest credential.
    pub fn require_digest(&self, user: &str, password: &str) {
        self.lock().required_auth = Some(("digest".to_string(), digest(user, password)));
    }

    /// Expire every open session, firing all armed watches with a session event.
    pub fn expire_sessions(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        for session in state.sessions.values_mut() {
            session.expired = true;
        }
        let watches: Vec<(String, Watch)> = state
            .data_watches
            .drain()
            .chain(state.exist_watches.drain())
            .flat_map(|(path, watches)| watches.into_iter().map(move |w| (path.clone(), w)))
            .collect();
        drop(guard);
        for (path, watch) in watches {
            let _ = watch
                .tx
                .send(NodeEvent::session(path, SessionError::SessionExpired));
        }
    }

    /// Open a session directly, bypassing the connector trait.
    pub fn session(&self) -> SimulatedSession {
        let mut state = self.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.connects += 1;
        state.sessions.insert(id, SessionState::default());
        SimulatedSession {
            ensemble: self.clone(),
            id,
            logger: LoggerSlot::default(),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn reconnect_count(&self) -> usize {
        self.lock().reconnects
    }

    pub fn auth_count(&self) -> usize {
        self.lock().auths
    }

    /// Raw read that ignores sessions, for assertions.
    pub fn node(&self, path: &str) -> Option<(Vec<u8>, Version)> {
        self.lock()
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SessionConnector for SimulatedEnsemble {
    async fn connect(
        &self,
        _machines: &[String],
        _timeout: Duration,
    ) -> Result<Arc<dyn SessionClient>, SessionError> {
        Ok(Arc::new(self.session()))
    }
}

/// One client session on a [`SimulatedEnsemble`].
#[derive(Debug)]
pub struct SimulatedSession {
    ensemble: SimulatedEnsemble,
    id: u64,
    logger: LoggerSlot,
}

impl SimulatedSession {
    fn checked(&self) -> Result<MutexGuard<'_, EnsembleState>, SessionError> {
        let state = self.ensemble.lock();
        let session = state
            .sessions
            .get(&self.id)
            .ok_or(SessionError::SessionExpired)?;
        if session.expired {
            return Err(SessionError::SessionExpired);
        }
        if let Some(required) = &state.required_auth {
            if !session.auth.iter().any(|a| a == required) {
                return Err(SessionError::NoAuth);
            }
        }
        Ok(state)
    }

    fn arm(
        &self,
        watches: &mut HashMap<String, Vec<Watch>>,
        path: &str,
    ) -> EventReceiver {
        let (tx, rx) = oneshot::channel();
        watches.entry(path.to_string()).or_default().push(Watch {
            session: self.id,
            tx,
        });
        rx
    }
}

fn fire(state: &mut EnsembleState, path: &str, kind: EventKind) {
    let mut fired = state.data_watches.remove(path).unwrap_or_default();
    fired.extend(state.exist_watches.remove(path).unwrap_or_default());
    for watch in fired {
        let _ = watch.tx.send(NodeEvent::node(kind, path));
    }
}

fn parent_of(node: &str) -> Option<String> {
    if node == "/" {
        return None;
    }
    match node.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(node[..idx].to_string()),
        None => None,
    }
}

fn direct_children(state: &EnsembleState, node: &str) -> Vec<String> {
    let prefix = path::dir_prefix(node);
    state
        .nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter_map(|(k, _)| {
            let rest = &k[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn digest(user: &str, password: &str) -> Vec<u8> {
    format!("{user}:{password}").into_bytes()
}

#[async_trait]
impl SessionClient for SimulatedSession {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), SessionError> {
        let state = self.checked()?;
        let node = state.nodes.get(path).ok_or(SessionError::NoNode)?;
        Ok((
            node.data.clone(),
            Stat {
                version: node.version,
                num_children: direct_children(&state, path).len() as i32,
            },
        ))
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Stat, EventReceiver), SessionError> {
        let mut state = self.checked()?;
        let node = state.nodes.get(path).cloned().ok_or(SessionError::NoNode)?;
        let num_children = direct_children(&state, path).len() as i32;
        let rx = self.arm(&mut state.data_watches, path);
        Ok((
            node.data,
            Stat {
                version: node.version,
                num_children,
            },
            rx,
        ))
    }

    async fn exists_w(&self, path: &str) -> Result<(Option<Stat>, EventReceiver), SessionError> {
        let mut state = self.checked()?;
        let stat = state.nodes.get(path).map(|node| Stat {
            version: node.version,
            num_children: 0,
        });
        let rx = self.arm(&mut state.exist_watches, path);
        Ok((stat, rx))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, SessionError> {
        let state = self.checked()?;
        if !state.nodes.contains_key(path) {
            return Err(SessionError::NoNode);
        }
        Ok(direct_children(&state, path))
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<String, SessionError> {
        let mut state = self.checked()?;
        if state.nodes.contains_key(path) {
            return Err(SessionError::NodeExists);
        }
        let parent = parent_of(path).ok_or_else(|| SessionError::Other(format!("invalid path {path}")))?;
        if !state.nodes.contains_key(&parent) {
            return Err(SessionError::NoNode);
        }
        state.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
            },
        );
        fire(&mut state, path, EventKind::NodeCreated);
        Ok(path.to_string())
    }

    async fn set(&self, path: &str, data: &[u8], version: Version) -> Result<Stat, SessionError> {
        let mut state = self.checked()?;
        let node = state.nodes.get_mut(path).ok_or(SessionError::NoNode)?;
        if version != ANY_VERSION && version != node.version {
            return Err(SessionError::BadVersion);
        }
        node.data = data.to_vec();
        node.version += 1;
        let stat = Stat {
            version: node.version,
            num_children: 0,
        };
        fire(&mut state, path, EventKind::NodeDataChanged);
        Ok(stat)
    }

    async fn delete(&self, path: &str, version: Version) -> Result<(), SessionError> {
        let mut state = self.checked()?;
        let node = state.nodes.get(path).ok_or(SessionError::NoNode)?;
        if version != ANY_VERSION && version != node.version {
            return Err(SessionError::BadVersion);
        }
        if !direct_children(&state, path).is_empty() {
            return Err(SessionError::NotEmpty);
        }
        state.nodes.remove(path);
        fire(&mut state, path, EventKind::NodeDeleted);
        Ok(())
    }

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<(), SessionError> {
        let mut state = self.ensemble.lock();
        state.auths += 1;
        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or(SessionError::SessionExpired)?;
        if session.expired {
            return Err(SessionError::SessionExpired);
        }
        session.auth.push((scheme.to_string(), auth.to_vec()));
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        let mut guard = self.ensemble.lock();
        let state = &mut *guard;
        state.reconnects += 1;
        state.sessions.insert(self.id, SessionState::default());
        for watches in state
            .data_watches
            .values_mut()
            .chain(state.exist_watches.values_mut())
        {
            watches.retain(|w| w.session != self.id);
        }
        drop(guard);
        self.logger
            .log(Level::INFO, &format!("simulated session {} re-established", self.id));
        Ok(())
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.logger.replace(logger);
    }
}
