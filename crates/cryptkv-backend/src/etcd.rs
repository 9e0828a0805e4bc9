//! Flat networked KV adapter speaking the etcd v3 JSON gateway.
//!
//! Keys are stored as given, leading `/` included. Requests go to the first
//! reachable machine. Watches poll the key.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cryptkv_core::{
    key_not_found, logger::LoggerSlot, path, watch_channel, CancellationToken, KvPair, KvPairs,
    Logger, Notifier, Response, Store, StoreError, WatchStream,
};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{instrument, Level};

use crate::{options::WatchOptions, zookeeper::Credentials};

const NAME: &str = "etcd";

/// Store adapter over one or more etcd members' gRPC gateway.
#[derive(Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Arc<[String]>,
    credentials: Option<Credentials>,
    token: Arc<Mutex<Option<String>>>,
    options: WatchOptions,
    logger: Arc<LoggerSlot>,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct DeleteRangeRequest {
    key: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<EtcdKv>,
}

#[derive(Debug, Deserialize)]
struct EtcdKv {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct Ack {}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: String,
}

impl EtcdStore {
    /// `machines` are member base URLs, e.g. `http://127.0.0.1:2379`.
    /// Credentials are exchanged for a token on first use.
    pub fn new(machines: &[String], credentials: Option<Credentials>) -> Result<Self, StoreError> {
        let endpoints: Vec<String> = machines
            .iter()
            .map(|m| m.trim().trim_end_matches('/').to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(StoreError::backend(NAME, "no machines"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoints: endpoints.into(),
            credentials: credentials.filter(|c| !c.user.is_empty()),
            token: Arc::new(Mutex::new(None)),
            options: WatchOptions::default(),
            logger: Arc::new(LoggerSlot::default()),
        })
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn fail(&self, op: &str, key: &str, err: impl std::fmt::Display) -> StoreError {
        self.logger
            .log(Level::DEBUG, &format!("{NAME}: {op} {key} failed: {err}"));
        StoreError::backend(NAME, format!("{op} {key}: {err}"))
    }

    /// POST `payload` to `route` on the first member that answers.
    async fn post(
        &self,
        op: &str,
        key: &str,
        route: &str,
        payload: &[u8],
        token: Option<&str>,
    ) -> Result<reqwest::Response, StoreError> {
        let mut last = None;
        for endpoint in self.endpoints.iter() {
            let mut request = self
                .client
                .post(format!("{endpoint}{route}"))
                .header(USER_AGENT, "cryptkv")
                .header(CONTENT_TYPE, "application/json")
                .body(payload.to_vec());
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, token);
            }
            match request.send().await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    self.logger
                        .log(Level::DEBUG, &format!("{NAME}: {endpoint} unreachable: {err}"));
                    last = Some(err);
                }
            }
        }
        Err(self.fail(
            op,
            key,
            last.map_or_else(|| "no machines".to_string(), |e| e.to_string()),
        ))
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        op: &str,
        key: &str,
        resp: reqwest::Response,
    ) -> Result<T, StoreError> {
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.fail(op, key, e))?;
        if !status.is_success() {
            return Err(self.fail(op, key, gateway_message(status, &body)));
        }
        serde_json::from_slice(&body)
            .map_err(|e| self.fail(op, key, format!("malformed response: {e}")))
    }

    /// Cached auth token, fetched on first use. `None` without credentials.
    async fn token(&self, op: &str, key: &str) -> Result<Option<String>, StoreError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(Some(token.clone()));
        }
        let payload = serde_json::to_vec(&AuthRequest {
            name: &credentials.user,
            password: &credentials.password,
        })
        .map_err(|e| self.fail(op, key, e))?;
        let resp = self
            .post(op, key, "/v3/auth/authenticate", &payload, None)
            .await?;
        let auth: AuthResponse = self.decode(op, key, resp).await?;
        self.logger
            .log(Level::DEBUG, &format!("{NAME}: authenticated as {}", credentials.user));
        *cached = Some(auth.token.clone());
        Ok(Some(auth.token))
    }

    /// One authenticated gateway call. A rejected token is dropped and the
    /// call retried once with a fresh one.
    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        op: &str,
        key: &str,
        route: &str,
        body: &B,
    ) -> Result<T, StoreError> {
        let payload = serde_json::to_vec(body).map_err(|e| self.fail(op, key, e))?;
        let token = self.token(op, key).await?;
        let resp = self.post(op, key, route, &payload, token.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED || token.is_none() {
            return self.decode(op, key, resp).await;
        }

        self.token.lock().await.take();
        let token = self.token(op, key).await?;
        let resp = self.post(op, key, route, &payload, token.as_deref()).await?;
        self.decode(op, key, resp).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let request = RangeRequest {
            key: BASE64.encode(key),
            range_end: None,
        };
        let range: RangeResponse = self.call("get", key, "/v3/kv/range", &request).await?;
        match range.kvs.into_iter().next() {
            Some(kv) => decode_base64(&kv.value).map_err(|e| self.fail("get", key, e)),
            None => Err(StoreError::not_found(NAME, key)),
        }
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("endpoints", &self.endpoints)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, String> {
    BASE64
        .decode(encoded)
        .map_err(|e| format!("bad base64 in response: {e}"))
}

fn gateway_message(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<GatewayError>(body) {
        Ok(err) if !err.message.is_empty() => format!("{status}: {}", err.message),
        Ok(err) if !err.error.is_empty() => format!("{status}: {}", err.error),
        _ => format!("{status}: {}", String::from_utf8_lossy(body).trim()),
    }
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: the range runs to the end of the keyspace.
    vec![0]
}

#[async_trait]
impl Store for EtcdStore {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.read(key).await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        let dir = path::dir_prefix(key);
        let request = RangeRequest {
            key: BASE64.encode(&dir),
            range_end: Some(BASE64.encode(prefix_end(dir.as_bytes()))),
        };
        let range: RangeResponse = self.call("list", &dir, "/v3/kv/range", &request).await?;
        range
            .kvs
            .into_iter()
            .map(|kv| {
                let name = decode_base64(&kv.key)
                    .and_then(|k| String::from_utf8(k).map_err(|e| format!("non-utf8 key: {e}")))
                    .map_err(|e| self.fail("list", &dir, e))?;
                let value = decode_base64(&kv.value).map_err(|e| self.fail("list", &name, e))?;
                Ok(KvPair::new(name, value))
            })
            .collect::<Result<KvPairs, StoreError>>()
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let request = PutRequest {
            key: BASE64.encode(key),
            value: BASE64.encode(value),
        };
        let _: Ack = self.call("set", key, "/v3/kv/put", &request).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let request = DeleteRangeRequest {
            key: BASE64.encode(key),
        };
        let _: Ack = self
            .call("delete", key, "/v3/kv/deleterange", &request)
            .await?;
        Ok(())
    }

    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream {
        let (notifier, stream) = watch_channel(stop);
        tokio::spawn(poll_key(self.clone(), key.to_string(), notifier));
        stream
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.logger.replace(logger);
    }
}

/// Push the current value or absence, then re-read every poll interval and
/// push only changes. Other errors are pushed and retried after the backoff.
async fn poll_key(store: EtcdStore, key: String, notifier: Notifier) {
    let mut last: Option<Response> = None;
    loop {
        let response = tokio::select! {
            biased;
            _ = notifier.stopped() => break,
            response = store.read(&key) => response,
        };
        let failed = matches!(&response, Err(err) if !key_not_found(err));
        let delay = if failed {
            last = None;
            if !notifier.send(response).await {
                break;
            }
            store.options.error_backoff
        } else {
            if last.as_ref() != Some(&response) {
                if !notifier.send(response.clone()).await {
                    break;
                }
                last = Some(response);
            }
            store.options.poll_interval
        };
        if !notifier.sleep(delay).await {
            break;
        }
    }
    store
        .logger
        .log(Level::DEBUG, &format!("{NAME}: watch {key} stopped"));
}
