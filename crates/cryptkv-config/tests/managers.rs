use std::{io::Write, sync::Arc, time::Duration};

use cryptkv_backend::{
    ConsulStore, Credentials, EtcdStore, MemoryStore, SessionRegistry, SimulatedEnsemble,
    WatchOptions, ZookeeperStore,
};
use cryptkv_config::{
    encrypted_manager, key_not_found, standard_manager, Backend, BackendConfig, ConfigError,
    ConfigManager, Manager, Response, StoreError, WatchStream,
};
use cryptkv_core::{CancellationToken, Store};
use cryptkv_secconf::KeyMaterial;
use cryptkv_test_utils::{FakeConsul, FakeEtcd};

fn fast() -> WatchOptions {
    WatchOptions {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(20),
    }
}

fn fast_memory() -> MemoryStore {
    MemoryStore::new().with_options(fast())
}

/// One fresh store per adapter, each behind its own in-process server.
async fn backends() -> Vec<(&'static str, Backend)> {
    let registry = SessionRegistry::new(Arc::new(SimulatedEnsemble::new()));
    let zookeeper = ZookeeperStore::connect(&registry, &["zk1:2181".to_string()], None)
        .await
        .expect("zookeeper")
        .with_watch_retry(Duration::from_millis(20));

    let consul_url = FakeConsul::new().start().await.expect("fake consul");
    let consul = ConsulStore::new(consul_url, None)
        .with_options(fast())
        .with_wait(Duration::from_secs(1));

    let etcd_url = FakeEtcd::new().start().await.expect("fake etcd");
    let etcd = EtcdStore::new(&[etcd_url], None)
        .expect("etcd")
        .with_options(fast());

    vec![
        ("memory", fast_memory().into()),
        ("zookeeper", zookeeper.into()),
        ("consul", consul.into()),
        ("etcd", etcd.into()),
    ]
}

/// Both manager flavours over every adapter.
async fn managers() -> Vec<(String, Arc<dyn ConfigManager>)> {
    let mut managers = Vec::new();
    for (backend, store) in backends().await {
        let key = KeyMaterial::generate();
        let standard: Arc<dyn ConfigManager> = Arc::new(Manager::standard(store.clone()));
        let encrypted: Arc<dyn ConfigManager> =
            Arc::new(Manager::encrypted(store, key.as_bytes()).expect("manager"));
        managers.push((format!("{backend}-standard"), standard));
        managers.push((format!("{backend}-encrypted"), encrypted));
    }
    managers
}

async fn next(stream: &mut WatchStream) -> Response {
    tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("notification within timeout")
        .expect("stream open")
}

#[tokio::test]
async fn set_then_get_round_trips() {
    for (name, manager) in managers().await {
        let name = name.as_str();
        let key = format!("/{name}/db/password");
        manager.set(&key, b"hunter2").await.expect(name);
        assert_eq!(manager.get(&key).await.expect(name), b"hunter2", "{name}");
    }
}

#[tokio::test]
async fn delete_is_idempotent_and_get_reports_not_found() {
    for (name, manager) in managers().await {
        let name = name.as_str();
        manager.delete("/never/set").await.expect(name);

        manager.set("/gone", b"v").await.expect(name);
        manager.delete("/gone").await.expect(name);
        let err = manager.get("/gone").await.expect_err(name);
        assert!(key_not_found(&err), "{name}: {err}");
    }
}

#[tokio::test]
async fn list_returns_exactly_the_keys_under_prefix() {
    for (name, manager) in managers().await {
        let name = name.as_str();
        let base = format!("/{name}");
        manager.set(&format!("{base}/app/a"), b"1").await.unwrap();
        manager.set(&format!("{base}/app/b"), b"2").await.unwrap();
        manager.set(&format!("{base}/apple"), b"3").await.unwrap();
        manager.set(&format!("{base}/app/db/user"), b"4").await.unwrap();

        let mut pairs = manager.list(&format!("{base}/app")).await.expect(name);
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        let rendered: Vec<(String, Vec<u8>)> =
            pairs.into_iter().map(|kv| (kv.key, kv.value)).collect();
        assert_eq!(
            rendered,
            vec![
                (format!("{base}/app/a"), b"1".to_vec()),
                (format!("{base}/app/b"), b"2".to_vec()),
                (format!("{base}/app/db/user"), b"4".to_vec()),
            ],
            "{name}"
        );
    }
}

#[tokio::test]
async fn encrypted_values_are_sealed_at_rest() {
    let store = fast_memory();
    let manager = Manager::encrypted(store.clone(), KeyMaterial::generate().as_bytes())
        .expect("manager");
    manager.set("/secret", b"plain value").await.unwrap();

    let raw = store.get("/secret").await.unwrap();
    assert_ne!(raw, b"plain value");
    assert!(!raw.windows(5).any(|w| w == b"plain"));
}

#[tokio::test]
async fn wrong_key_material_is_a_decode_error() {
    let store = fast_memory();
    let writer = Manager::encrypted(store.clone(), KeyMaterial::generate().as_bytes()).unwrap();
    let reader = Manager::encrypted(store.clone(), KeyMaterial::generate().as_bytes()).unwrap();
    writer.set("/dir/k", b"v").await.unwrap();

    assert!(matches!(reader.get("/dir/k").await, Err(StoreError::Decode(_))));
    assert!(matches!(reader.list("/dir").await, Err(StoreError::Decode(_))));

    let standard = Manager::standard(store);
    let raw = standard.get("/dir/k").await.expect("raw read");
    assert_ne!(raw, b"v");
}

#[tokio::test]
async fn watch_emits_initial_value_then_update_then_stops() {
    for (name, manager) in managers().await {
        let name = name.as_str();
        let key = format!("/{name}/watched");
        manager.set(&key, b"X").await.unwrap();

        let stop = CancellationToken::new();
        let mut stream = manager.watch(&key, stop.clone());
        assert_eq!(next(&mut stream).await.expect(name), b"X", "{name}");

        manager.set(&key, b"Y").await.unwrap();
        assert_eq!(next(&mut stream).await.expect(name), b"Y", "{name}");

        stop.cancel();
        manager.set(&key, b"Z").await.unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(resp) = stream.recv().await {
                assert_ne!(resp.ok(), Some(b"Z".to_vec()), "{name}: no value after stop");
            }
        })
        .await;
        assert!(drained.is_ok(), "{name}: stream closes after stop");
    }
}

#[tokio::test]
async fn watch_forwards_errors_unchanged() {
    for (name, manager) in managers().await {
        let name = name.as_str();
        let stop = CancellationToken::new();
        let mut stream = manager.watch("/absent", stop.clone());
        let err = next(&mut stream).await.expect_err(name);
        assert!(key_not_found(&err), "{name}: {err}");
        assert!(err.to_string().ends_with("key not found: /absent"), "{name}: {err}");
        stop.cancel();
    }
}

#[tokio::test]
async fn concurrent_watches_are_independent() {
    for (name, manager) in managers().await {
        let name = name.as_str();
        let key = format!("/{name}/shared");
        manager.set(&key, b"1").await.unwrap();

        let stop_a = CancellationToken::new();
        let stop_b = CancellationToken::new();
        let mut a = manager.watch(&key, stop_a.clone());
        let mut b = manager.watch(&key, stop_b.clone());
        assert_eq!(next(&mut a).await.expect(name), b"1");
        assert_eq!(next(&mut b).await.expect(name), b"1");

        stop_a.cancel();
        manager.set(&key, b"2").await.unwrap();
        assert_eq!(next(&mut b).await.expect(name), b"2", "{name}");
        stop_b.cancel();
    }
}

#[tokio::test]
async fn encrypted_manager_survives_session_loss() {
    let ensemble = SimulatedEnsemble::new();
    ensemble.require_digest("app", "pw");
    let registry =
        SessionRegistry::new(Arc::new(ensemble.clone())).with_connect_timeout(Duration::from_secs(5));
    let store = ZookeeperStore::connect(
        &registry,
        &["zk1:2181".to_string()],
        Some(Credentials::new("app", "pw")),
    )
    .await
    .expect("connect");
    let manager =
        Manager::encrypted(store, KeyMaterial::generate().as_bytes()).expect("manager");

    manager.set("/svc/token", b"abc").await.expect("set");
    let stop = CancellationToken::new();
    let mut stream = manager.watch("/svc/token", stop.clone());
    assert_eq!(next(&mut stream).await.expect("initial"), b"abc");

    ensemble.expire_sessions();
    assert_eq!(manager.get("/svc/token").await.expect("get after loss"), b"abc");
    assert!(ensemble.reconnect_count() >= 1);

    manager.set("/svc/token", b"def").await.expect("set after loss");
    let value = loop {
        match next(&mut stream).await {
            Ok(value) if value == b"def" => break value,
            Ok(value) => assert_eq!(value, b"abc"),
            Err(err) => assert!(err.to_string().starts_with("zookeeper: watch"), "{err}"),
        }
    };
    assert_eq!(value, b"def");
    stop.cancel();
}

#[tokio::test]
async fn factory_builds_managers_from_config() {
    let registry = SessionRegistry::new(Arc::new(SimulatedEnsemble::new()));
    let config = BackendConfig::Zookeeper {
        machines: vec!["zk1:2181".into()],
        user: String::new(),
        password: String::new(),
    };

    let mut keystore = tempfile::NamedTempFile::new().expect("tempfile");
    keystore
        .write_all(KeyMaterial::generate().as_bytes())
        .expect("write keystore");
    let file = std::fs::File::open(keystore.path()).expect("open keystore");

    let encrypted = encrypted_manager(&config, &registry, file)
        .await
        .expect("encrypted manager");
    encrypted.set("/factory/k", b"v").await.expect("set");

    let standard = standard_manager(&config, &registry)
        .await
        .expect("standard manager");
    let raw = standard.get("/factory/k").await.expect("same session");
    assert_ne!(raw, b"v");
    assert_eq!(encrypted.get("/factory/k").await.expect("get"), b"v");
}

#[tokio::test]
async fn factory_rejects_zookeeper_without_connector() {
    let config = BackendConfig::Zookeeper {
        machines: vec!["zk1:2181".into()],
        user: "app".into(),
        password: "pw".into(),
    };
    let err = standard_manager(&config, &SessionRegistry::default())
        .await
        .expect_err("no connector");
    assert!(matches!(err, ConfigError::MissingConnector));
}
