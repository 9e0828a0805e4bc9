//! Minimal etcd v3 JSON gateway: `kv/range`, `kv/put`, `kv/deleterange` and
//! `auth/authenticate`. Keys and values travel base64-encoded, int64 fields
//! as strings, as the real gateway does.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};

use crate::http::{self, Reply, Request};

#[derive(Default)]
struct State {
    kv: BTreeMap<Vec<u8>, (Vec<u8>, i64)>,
    revision: i64,
    user: Option<(String, String)>,
    issued: Vec<String>,
    requests: usize,
}

#[derive(Clone, Default)]
pub struct FakeEtcd {
    state: Arc<Mutex<State>>,
}

impl FakeEtcd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject kv calls without a token issued for `user`/`password`.
    pub fn require_auth(self, user: &str, password: &str) -> Self {
        self.lock().user = Some((user.to_string(), password.to_string()));
        self
    }

    pub async fn start(&self) -> io::Result<String> {
        let fake = self.clone();
        http::serve(move |request| {
            let fake = fake.clone();
            async move { fake.handle(request) }
        })
        .await
    }

    pub fn put(&self, key: &str, value: &[u8]) {
        let mut state = self.lock();
        state.revision += 1;
        let revision = state.revision;
        state
            .kv
            .insert(key.as_bytes().to_vec(), (value.to_vec(), revision));
    }

    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().kv.get(key.as_bytes()).map(|(v, _)| v.clone())
    }

    /// Tokens handed out by `auth/authenticate`.
    pub fn issued_tokens(&self) -> usize {
        self.lock().issued.len()
    }

    pub fn requests(&self) -> usize {
        self.lock().requests
    }

    /// Forget every issued token, as after an auth revision bump.
    pub fn revoke_tokens(&self) {
        self.lock().issued.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, request: Request) -> Reply {
        let mut state = self.lock();
        state.requests += 1;
        if request.method != "POST" {
            return Reply::new(405, Vec::new());
        }
        let body: Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(err) => return error(400, 3, &format!("invalid body: {err}")),
        };

        if request.path == "/v3/auth/authenticate" {
            let (name, password) = (field(&body, "name"), field(&body, "password"));
            let accepted = state
                .user
                .as_ref()
                .is_some_and(|(u, p)| *u == name && *p == password);
            if !accepted {
                return error(
                    401,
                    3,
                    "etcdserver: authentication failed, invalid user ID or password",
                );
            }
            let token = format!("token-{}", state.issued.len() + 1);
            state.issued.push(token.clone());
            return Reply::new(200, json!({ "token": token }).to_string());
        }

        if state.user.is_some() {
            let authorized = request
                .header("authorization")
                .is_some_and(|token| state.issued.iter().any(|t| t == token));
            if !authorized {
                return error(401, 16, "etcdserver: invalid auth token");
            }
        }

        let key = decode(&body, "key");
        match request.path.as_str() {
            "/v3/kv/range" => {
                let range_end = body.get("range_end").map(|_| decode(&body, "range_end"));
                let kvs: Vec<Value> = state
                    .kv
                    .iter()
                    .filter(|(k, _)| match &range_end {
                        None => **k == key,
                        Some(end) if end.as_slice() == &b"\0"[..] => **k >= key,
                        Some(end) => **k >= key && *k < end,
                    })
                    .map(|(k, (v, rev))| {
                        let mut kv = json!({
                            "key": BASE64.encode(k),
                            "mod_revision": rev.to_string(),
                        });
                        // The gateway omits empty values.
                        if !v.is_empty() {
                            kv["value"] = json!(BASE64.encode(v));
                        }
                        kv
                    })
                    .collect();
                let mut reply = json!({
                    "header": { "revision": state.revision.to_string() },
                    "count": kvs.len().to_string(),
                });
                if !kvs.is_empty() {
                    reply["kvs"] = Value::Array(kvs);
                }
                Reply::new(200, reply.to_string())
            }
            "/v3/kv/put" => {
                state.revision += 1;
                let revision = state.revision;
                state.kv.insert(key, (decode(&body, "value"), revision));
                Reply::new(
                    200,
                    json!({ "header": { "revision": revision.to_string() } }).to_string(),
                )
            }
            "/v3/kv/deleterange" => {
                let deleted = usize::from(state.kv.remove(&key).is_some());
                state.revision += deleted as i64;
                Reply::new(
                    200,
                    json!({
                        "header": { "revision": state.revision.to_string() },
                        "deleted": deleted.to_string(),
                    })
                    .to_string(),
                )
            }
            _ => error(404, 5, "Not Found"),
        }
    }
}

fn field(body: &Value, name: &str) -> String {
    body.get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn decode(body: &Value, name: &str) -> Vec<u8> {
    BASE64.decode(field(body, name)).unwrap_or_default()
}

fn error(status: u16, code: u16, message: &str) -> Reply {
    Reply::new(
        status,
        json!({ "error": message, "code": code, "message": message }).to_string(),
    )
}
