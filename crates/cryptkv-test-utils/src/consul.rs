//! Minimal Consul agent: `/v1/kv` with `?raw`, `?recurse`, blocking queries,
//! and ACL token capture.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::http::{self, Reply, Request};

/// How long a blocking query on an unchanged index is held.
const HOLD: Duration = Duration::from_millis(100);

#[derive(Default)]
struct State {
    kv: BTreeMap<String, Vec<u8>>,
    index: u64,
    tokens: Vec<Option<String>>,
    omit_index: bool,
}

#[derive(Clone, Default)]
pub struct FakeConsul {
    state: Arc<Mutex<State>>,
}

impl FakeConsul {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer without `X-Consul-Index`, like a proxy that strips it.
    pub fn without_index(self) -> Self {
        self.lock().omit_index = true;
        self
    }

    /// Start serving; returns the agent's base URL.
    pub async fn start(&self) -> io::Result<String> {
        let fake = self.clone();
        http::serve(move |request| {
            let fake = fake.clone();
            async move { fake.handle(request).await }
        })
        .await
    }

    /// Write directly, bypassing HTTP. Keys have no leading `/`.
    pub fn put(&self, key: &str, value: &[u8]) {
        let mut state = self.lock();
        state.index += 1;
        state.kv.insert(key.to_string(), value.to_vec());
    }

    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().kv.get(key).cloned()
    }

    /// ACL token of every request received, in arrival order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.lock().tokens.clone()
    }

    pub fn requests(&self) -> usize {
        self.lock().tokens.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn handle(&self, request: Request) -> Reply {
        if let Some(index) = request.param("index").and_then(|i| i.parse::<u64>().ok()) {
            let deadline = tokio::time::Instant::now() + HOLD;
            while self.lock().index == index && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let mut state = self.lock();
        state
            .tokens
            .push(request.header("x-consul-token").map(str::to_string));
        let key = request.path.trim_start_matches("/v1/kv/").to_string();
        let reply = match request.method.as_str() {
            "GET" if request.has("recurse") => {
                let entries: Vec<serde_json::Value> = state
                    .kv
                    .iter()
                    .filter(|(k, _)| k.starts_with(&key))
                    .map(|(k, v)| serde_json::json!({ "Key": k, "Value": BASE64.encode(v) }))
                    .collect();
                if entries.is_empty() {
                    Reply::new(404, Vec::new())
                } else {
                    Reply::new(200, serde_json::to_vec(&entries).unwrap_or_default())
                }
            }
            "GET" => match state.kv.get(&key) {
                Some(value) => Reply::new(200, value.clone()),
                None => Reply::new(404, Vec::new()),
            },
            "PUT" => {
                state.index += 1;
                state.kv.insert(key, request.body);
                Reply::new(200, b"true".to_vec())
            }
            "DELETE" => {
                state.index += 1;
                state.kv.remove(&key);
                Reply::new(200, b"true".to_vec())
            }
            _ => Reply::new(405, Vec::new()),
        };
        if state.omit_index {
            reply
        } else {
            reply.with_header("X-Consul-Index", state.index)
        }
    }
}
