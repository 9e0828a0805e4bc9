use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use cryptkv_core::{
    logger::LoggerSlot, path, watch_channel, CancellationToken, KvPair, KvPairs, Logger, Notifier,
    StoreError, Store, WatchStream,
};
use once_cell::sync::Lazy;
use tracing::{instrument, Level};

use crate::options::WatchOptions;

const NAME: &str = "memory";

type Map = Arc<Mutex<HashMap<String, Vec<u8>>>>;

static SHARED: Lazy<Map> = Lazy::new(|| Arc::new(Mutex::new(HashMap::new())));

/// In-process store for tests and smoke runs. Watches poll the map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Map,
    options: WatchOptions,
    logger: Arc<LoggerSlot>,
}

impl MemoryStore {
    /// A store with its own private map.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the process-wide map, created on first use.
    pub fn shared() -> Self {
        Self {
            inner: Arc::clone(&SHARED),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.inner
            .lock()
            .map_err(|err| StoreError::backend(NAME, format!("lock poisoned: {err}")))
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(NAME, key))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.read(key)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn list(&self, key: &str) -> Result<KvPairs, StoreError> {
        let dir = path::dir_prefix(key);
        let map = self.lock()?;
        Ok(map
            .iter()
            .filter(|(k, _)| k.starts_with(&dir))
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
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

/// Push the current value, then re-read on every tick and push only changes.
/// Errors are pushed as they happen and retried after the error backoff.
async fn poll_key(store: MemoryStore, key: String, notifier: Notifier) {
    let mut last: Option<Vec<u8>> = None;
    loop {
        match store.read(&key) {
            Ok(value) => {
                if last.as_ref() != Some(&value) {
                    if !notifier.send(Ok(value.clone())).await {
                        break;
                    }
                    last = Some(value);
                }
                if !notifier.sleep(store.options.poll_interval).await {
                    break;
                }
            }
            Err(err) => {
                last = None;
                store
                    .logger
                    .log(Level::DEBUG, &format!("{NAME}: watch {key}: {err}"));
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cryptkv_core::{key_not_found, RecordingLogger};

    use super::*;

    fn fast() -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(20),
        }
    }

    async fn next(stream: &mut WatchStream) -> cryptkv_core::Response {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("notification within timeout")
            .expect("stream open")
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryStore::new();
        store.set("/app/db", b"v1").await.expect("set");
        assert_eq!(store.get("/app/db").await.expect("get"), b"v1");

        store.set("/app/db", b"v2").await.expect("overwrite");
        assert_eq!(store.get("/app/db").await.expect("get"), b"v2");

        store.delete("/app/db").await.expect("delete");
        let err = store.get("/app/db").await.expect_err("gone");
        assert!(key_not_found(&err));
        assert_eq!(err.to_string(), "memory: key not found: /app/db");
    }

    #[tokio::test]
    async fn delete_missing_key_is_ok() {
        let store = MemoryStore::new();
        store.delete("/never/set").await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn list_uses_directory_prefix() {
        let store = MemoryStore::new();
        store.set("/app/db/user", b"u").await.unwrap();
        store.set("/app/db/password", b"p").await.unwrap();
        store.set("/app/dbx", b"x").await.unwrap();
        store.set("/other", b"o").await.unwrap();

        let mut keys: Vec<String> = store
            .list("/app/db/")
            .await
            .expect("list")
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["/app/db/password", "/app/db/user"]);

        assert!(store.list("/missing").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn shared_handles_see_the_same_map() {
        let a = MemoryStore::shared();
        let b = MemoryStore::shared();
        a.set("/memory-tests/shared", b"yes").await.unwrap();
        assert_eq!(b.get("/memory-tests/shared").await.unwrap(), b"yes");
        b.delete("/memory-tests/shared").await.unwrap();

        let private = MemoryStore::new();
        assert!(private.get("/memory-tests/shared").await.is_err());
    }

    #[tokio::test]
    async fn watch_emits_initial_value_then_changes() {
        let store = MemoryStore::new().with_options(fast());
        store.set("/a/b", b"X").await.unwrap();

        let stop = CancellationToken::new();
        let mut stream = store.watch("/a/b", stop.clone());
        assert_eq!(next(&mut stream).await.expect("value"), b"X");

        store.set("/a/b", b"Y").await.unwrap();
        assert_eq!(next(&mut stream).await.expect("value"), b"Y");

        stop.cancel();
        store.set("/a/b", b"Z").await.unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(resp) = stream.recv().await {
                assert_ne!(resp.ok(), Some(b"Z".to_vec()), "no notification after stop");
            }
        })
        .await;
        assert!(drained.is_ok(), "stream closes after stop");
    }

    #[tokio::test]
    async fn watch_reports_missing_key_and_recovers() {
        let store = MemoryStore::new().with_options(fast());
        let recorder = RecordingLogger::new();
        store.set_logger(Arc::new(recorder.clone()));

        let stop = CancellationToken::new();
        let mut stream = store.watch("/late", stop.clone());
        let first = next(&mut stream).await.expect_err("missing");
        assert!(key_not_found(&first));

        store.set("/late", b"here").await.unwrap();
        loop {
            match next(&mut stream).await {
                Ok(value) => {
                    assert_eq!(value, b"here");
                    break;
                }
                Err(err) => assert!(key_not_found(&err)),
            }
        }
        stop.cancel();
        assert!(recorder.contains("memory: watch /late"));
    }

    #[tokio::test]
    async fn concurrent_watches_are_independent() {
        let store = MemoryStore::new().with_options(fast());
        store.set("/k", b"1").await.unwrap();

        let stop_a = CancellationToken::new();
        let stop_b = CancellationToken::new();
        let mut a = store.watch("/k", stop_a.clone());
        let mut b = store.watch("/k", stop_b.clone());
        assert_eq!(next(&mut a).await.unwrap(), b"1");
        assert_eq!(next(&mut b).await.unwrap(), b"1");

        stop_a.cancel();
        store.set("/k", b"2").await.unwrap();
        assert_eq!(next(&mut b).await.unwrap(), b"2");
        stop_b.cancel();
    }
}
