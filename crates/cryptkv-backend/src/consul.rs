//! Flat networked KV adapter speaking the Consul HTTP KV API.
//!
//! Keys are stored without their leading `/`; `list` restores it. Watches use
//! blocking queries keyed on `X-Consul-Index`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cryptkv_core::{
    logger::LoggerSlot, path, watch_channel, CancellationToken, KvPair, KvPairs, Logger, Notifier,
    Response, Store, StoreError, WatchStream,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    RequestBuilder, StatusCode, Url,
};
use serde::Deserialize;
use tracing::{instrument, Level};

use crate::options::WatchOptions;

const NAME: &str = "consul";
const TOKEN_HEADER: &str = "x-consul-token";
const INDEX_HEADER: &str = "x-consul-index";
const DEFAULT_WAIT: Duration = Duration::from_secs(60);

/// Store adapter over a Consul agent's KV endpoint.
#[derive(Clone)]
pub struct ConsulStore {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    wait: Duration,
    options: WatchOptions,
    logger: Arc<LoggerSlot>,
}

impl ConsulStore {
    /// `endpoint` is the agent's base URL, e.g. `http://127.0.0.1:8500`.
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            wait: DEFAULT_WAIT,
            options: WatchOptions::default(),
            logger: Arc::new(LoggerSlot::default()),
        }
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Longest time a watch's blocking query waits server-side.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `/v1/kv/<key>` below the endpoint, each key segment percent-encoded so
    /// `?`, `#` and `%` stay part of the key.
    fn kv_url(&self, key: &str, query: Option<&str>) -> Result<Url, StoreError> {
        let invalid = |reason: String| {
            StoreError::backend(NAME, format!("invalid endpoint {}: {reason}", self.endpoint))
        };
        let mut url = Url::parse(&self.endpoint).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("not a base URL".into()))?
            .pop_if_empty()
            .extend(["v1", "kv"])
            .extend(key.trim_start_matches('/').split('/'));
        url.set_query(query);
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("cryptkv"));
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| StoreError::backend(NAME, format!("invalid token: {e}")))?;
            headers.insert(TOKEN_HEADER, value);
        }
        Ok(headers)
    }

    async fn send(
        &self,
        op: &str,
        key: &str,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let request = request.headers(self.headers()?);
        request.send().await.map_err(|e| self.fail(op, key, e))
    }

    fn fail(&self, op: &str, key: &str, err: impl std::fmt::Display) -> StoreError {
        self.logger
            .log(Level::DEBUG, &format!("{NAME}: {op} {key} failed: {err}"));
        StoreError::backend(NAME, format!("{op} {key}: {err}"))
    }

    async fn body(
        &self,
        op: &str,
        key: &str,
        resp: reqwest::Response,
    ) -> Result<Vec<u8>, StoreError> {
        let resp = resp.error_for_status().map_err(|e| self.fail(op, key, e))?;
        let bytes = resp.bytes().await.map_err(|e| self.fail(op, key, e))?;
        Ok(bytes.to_vec())
    }

    /// One read of `key`, blocking server-side while the index is still
    /// `index`. Returns the new index and the value, or `None` when absent.
    async fn fetch(
        &self,
        key: &str,
        index: u64,
    ) -> Result<(u64, Option<Vec<u8>>), StoreError> {
        let mut request = self.client.get(self.kv_url(key, Some("raw"))?);
        if index > 0 {
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", self.wait.as_secs().max(1))),
                ])
                // Consul adds up to wait/16 of jitter.
                .timeout(self.wait + self.wait / 16 + Duration::from_secs(5));
        }
        let resp = self.send("watch", key, request).await?;
        let next = index_of(&resp);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((next, None));
        }
        let value = self.body("watch", key, resp).await?;
        Ok((next, Some(value)))
    }
}

impl std::fmt::Debug for ConsulStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulStore")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Decode a `?recurse` response body. Folder placeholders (keys ending in `/`)
/// are skipped.
fn parse_entries(body: &[u8]) -> Result<KvPairs, StoreError> {
    let entries: Vec<Entry> = serde_json::from_slice(body)
        .map_err(|e| StoreError::backend(NAME, format!("list: malformed response: {e}")))?;
    entries
        .into_iter()
        .filter(|entry| !entry.key.ends_with('/'))
        .map(|entry| {
            let value = match entry.value {
                Some(encoded) => BASE64.decode(encoded).map_err(|e| {
                    StoreError::backend(NAME, format!("list: bad value for {}: {e}", entry.key))
                })?,
                None => Vec::new(),
            };
            Ok(KvPair::new(format!("/{}", entry.key), value))
        })
        .collect()
}

fn index_of(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Store for ConsulStore {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let request = self.client.get(self.kv_url(key, Some("raw"))?);
        let resp = self.send("get", key, request).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found(NAME, key));
        }
        self.body("get", key, resp).await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        let dir = path::dir_prefix(key);
        let request = self.client.get(self.kv_url(&dir, Some("recurse"))?);
        let resp = self.send("list", &dir, request).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = self.body("list", &dir, resp).await?;
        parse_entries(&body)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let request = self.client.put(self.kv_url(key, None)?).body(value.to_vec());
        let resp = self.send("set", key, request).await?;
        let body = self.body("set", key, resp).await?;
        if body.trim_ascii() == b"false" {
            return Err(self.fail("set", key, "write rejected"));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let request = self.client.delete(self.kv_url(key, None)?);
        let resp = self.send("delete", key, request).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.body("delete", key, resp).await.map(|_| ())
    }

    fn watch(&self, key: &str, stop: CancellationToken) -> WatchStream {
        let (notifier, stream) = watch_channel(stop);
        tokio::spawn(watch_key(self.clone(), key.to_string(), notifier));
        stream
    }

    fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.logger.replace(logger);
    }
}

/// Blocking-query loop: push the current value, then push again whenever the
/// index advances and the value differs from the last one pushed. Without an
/// index from the agent the loop polls at the poll interval instead.
async fn watch_key(store: ConsulStore, key: String, notifier: Notifier) {
    let mut index = 0;
    let mut last: Option<Response> = None;
    loop {
        let fetched = tokio::select! {
            biased;
            _ = notifier.stopped() => break,
            fetched = store.fetch(&key, index) => fetched,
        };
        match fetched {
            Ok((next, value)) => {
                // A reset index means the agent lost its state; start over.
                index = if next < index { 0 } else { next };
                let response = value.ok_or_else(|| StoreError::not_found(NAME, key.as_str()));
                if last.as_ref() != Some(&response) {
                    if !notifier.send(response.clone()).await {
                        break;
                    }
                    last = Some(response);
                }
                if next == 0 && !notifier.sleep(store.options.poll_interval).await {
                    break;
                }
            }
            Err(err) => {
                last = None;
                index = 0;
                if !notifier.send(Err(err)).await {
                    break;
                }
                if !notifier.sleep(store.options.error_backoff).await {
                    break;
                }
            }
        }
    }
    store
        .logger
        .log(Level::DEBUG, &format!("{NAME}: watch {key} stopped"));
}
