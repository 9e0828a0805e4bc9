use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use cryptkv_config::BackendConfig;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

use crate::cli::{BackendKind, Overrides};

const DEFAULT_CONSUL_ENDPOINT: &str = "http://127.0.0.1:8500";
const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";

/// User-level configuration loaded from `~/.config/cryptkv/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Store values unencrypted.
    #[serde(default)]
    pub plaintext: bool,
    /// Backend to read from and write to.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Where key material comes from when values are encrypted.
    #[serde(default)]
    pub keys: KeySource,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum KeySource {
    /// OS keychain entry, generated on first use.
    Keyring { service: String, account: String },
    /// Keystore file written by `cryptkv keygen --out`.
    File { path: PathBuf },
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::Keyring {
            service: "cryptkv".into(),
            account: "keystore".into(),
        }
    }
}

impl Config {
    /// Apply command line flags on top of the loaded file.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        match overrides.backend {
            Some(BackendKind::Memory) => self.backend = BackendConfig::Memory { shared: true },
            Some(BackendKind::Consul) if !matches!(self.backend, BackendConfig::Consul { .. }) => {
                self.backend = BackendConfig::Consul {
                    endpoint: DEFAULT_CONSUL_ENDPOINT.into(),
                    token: None,
                };
            }
            Some(BackendKind::Etcd) if !matches!(self.backend, BackendConfig::Etcd { .. }) => {
                self.backend = BackendConfig::Etcd {
                    machines: vec![DEFAULT_ETCD_ENDPOINT.into()],
                    user: String::new(),
                    password: String::new(),
                };
            }
            _ => {}
        }
        if let BackendConfig::Consul { endpoint, token } = &mut self.backend {
            if let Some(flag) = &overrides.endpoint {
                *endpoint = flag.clone();
            }
            if overrides.token.is_some() {
                *token = overrides.token.clone();
            }
        }
        if let (BackendConfig::Etcd { machines, .. }, Some(flag)) =
            (&mut self.backend, &overrides.endpoint)
        {
            *machines = flag
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = &overrides.keystore {
            self.keys = KeySource::File { path: path.clone() };
        } else if overrides.keyring && !matches!(self.keys, KeySource::Keyring { .. }) {
            self.keys = KeySource::default();
        }
        self.plaintext |= overrides.plaintext;
        self
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("cryptkv").join("config.toml"))
}

/// Write the given config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
