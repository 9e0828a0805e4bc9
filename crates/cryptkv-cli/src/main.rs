mod cli;
mod config;
mod storage;

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use clap::Parser;
use color_eyre::Result;
use cryptkv_config::ConfigManager;
use cryptkv_core::CancellationToken;
use cryptkv_secconf::KeyMaterial;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?.with_overrides(&cli.overrides);
    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Keygen { out } => run_keygen(out.as_deref())?,
        command => {
            let manager = storage::manager_from_config(&config).await?;
            run_data_command(command, manager.as_ref()).await?
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters; logs go to stderr so values on stdout stay clean.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("cryptkv {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

async fn run_data_command(command: Command, manager: &dyn ConfigManager) -> Result<()> {
    match command {
        Command::Get { key } => {
            let value = manager.get(&key).await?;
            io::stdout().lock().write_all(&value)?;
        }
        Command::Set { key, value, file } => {
            let value = read_value(value, file.as_deref())?;
            manager.set(&key, &value).await?;
        }
        Command::List { key } => {
            let pairs = manager.list(&key).await?;
            let mut stdout = io::stdout().lock();
            for kv in pairs {
                writeln!(stdout, "{}: {}", kv.key, String::from_utf8_lossy(&kv.value))?;
            }
        }
        Command::Delete { key } => manager.delete(&key).await?,
        Command::Watch { key } => run_watch(manager, &key).await?,
        Command::Health => {
            run_health_check(manager).await?;
            println!("Backend: ok");
        }
        Command::Version | Command::Config(_) | Command::Keygen { .. } => {}
    }
    Ok(())
}

/// Value for `set`: the positional argument, the file, or all of stdin.
fn read_value(value: Option<String>, file: Option<&Path>) -> Result<Vec<u8>> {
    if let Some(value) = value {
        return Ok(value.into_bytes());
    }
    if let Some(path) = file {
        return Ok(fs::read(path)?);
    }
    let mut buf = Vec::new();
    io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

async fn run_watch(manager: &dyn ConfigManager, key: &str) -> Result<()> {
    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut stream = manager.watch(key, stop);
    while let Some(response) = stream.recv().await {
        match response {
            Ok(value) => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(&value)?;
                writeln!(stdout)?;
                stdout.flush()?;
            }
            Err(err) => warn!(%key, "watch: {err}"),
        }
    }
    info!(%key, "watch stopped");
    Ok(())
}

/// Set, read back, and delete a scratch key.
async fn run_health_check(manager: &dyn ConfigManager) -> Result<()> {
    let health_key = "/cryptkv/health/check";
    let payload = b"ok";
    manager.set(health_key, payload).await?;
    let round_trip = manager.get(health_key).await?;
    manager.delete(health_key).await?;

    if round_trip != payload {
        color_eyre::eyre::bail!("backend round-trip failed");
    }
    Ok(())
}

fn run_keygen(out: Option<&Path>) -> Result<()> {
    let material = KeyMaterial::generate();
    match out {
        Some(path) => {
            write_keystore(path, &material)?;
            println!("Key material written to {}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(material.as_bytes())?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

/// Create `path` with the key material; refuses to replace an existing keystore.
fn write_keystore(path: &Path, material: &KeyMaterial) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(material.as_bytes())?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use cryptkv_backend::MemoryStore;
    use cryptkv_config::Manager;

    use super::*;

    #[tokio::test]
    async fn health_check_with_memory_backends_succeeds() {
        let standard = Manager::standard(MemoryStore::new());
        run_health_check(&standard)
            .await
            .expect("health check should succeed");

        let encrypted = Manager::encrypted(MemoryStore::new(), KeyMaterial::generate().as_bytes())
            .expect("manager");
        run_health_check(&encrypted)
            .await
            .expect("health check should succeed");
    }

    #[tokio::test]
    async fn health_check_reports_decode_failures() {
        let store = MemoryStore::new();
        let manager = Manager::encrypted(store, &b"garbage"[..]).expect("manager");
        assert!(run_health_check(&manager).await.is_err());
    }

    #[test]
    fn read_value_prefers_argument_then_file() {
        assert_eq!(
            read_value(Some("inline".into()), None).expect("arg"),
            b"inline"
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("value.bin");
        fs::write(&path, [0u8, 159, 146, 150]).expect("write");
        assert_eq!(
            read_value(None, Some(&path)).expect("file"),
            vec![0u8, 159, 146, 150]
        );
    }

    #[test]
    fn keystore_is_written_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("keystore");
        let material = KeyMaterial::generate();

        write_keystore(&path, &material).expect("first write");
        assert_eq!(fs::read(&path).expect("read"), material.as_bytes());
        assert!(write_keystore(&path, &KeyMaterial::generate()).is_err());
        assert_eq!(fs::read(&path).expect("read"), material.as_bytes());
    }
}
