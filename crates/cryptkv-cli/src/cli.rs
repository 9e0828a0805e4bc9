use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "cryptkv",
    about = "Read and write encrypted configuration in a key/value store",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that take precedence over the config file.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Backend to talk to.
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendKind>,
    /// Backend address, e.g. http://127.0.0.1:8500 for consul. Etcd takes a
    /// comma-separated list of members.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,
    /// ACL token sent to the backend.
    #[arg(long, global = true)]
    pub token: Option<String>,
    /// Read key material from this keystore file.
    #[arg(long, global = true, conflicts_with = "keyring")]
    pub keystore: Option<PathBuf>,
    /// Keep key material in the OS keychain (created on first use).
    #[arg(long, global = true)]
    pub keyring: bool,
    /// Store values unencrypted.
    #[arg(long, global = true)]
    pub plaintext: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Consul,
    Etcd,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the value stored at KEY.
    Get { key: String },
    /// Store a value at KEY, from the argument, --file, or stdin.
    Set {
        key: String,
        value: Option<String>,
        #[arg(long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },
    /// Print every entry below KEY.
    List { key: String },
    /// Remove KEY.
    Delete { key: String },
    /// Print KEY's value and every change until interrupted.
    Watch { key: String },
    /// Generate new key material.
    Keygen {
        /// Write to this file instead of stdout; never overwrites.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a set/get/delete round trip against the configured backend.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_subcommand() {
        let cli = Cli::try_parse_from(["cryptkv", "get", "/app/db"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Get { key: "/app/db".into() });
        assert_eq!(cli.overrides, Overrides::default());
    }

    #[test]
    fn parses_set_with_file() {
        let cli = Cli::try_parse_from(["cryptkv", "set", "/k", "--file", "value.bin"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Command::Set {
                key: "/k".into(),
                value: None,
                file: Some(PathBuf::from("value.bin")),
            }
        );
    }

    #[test]
    fn rejects_value_and_file_together() {
        assert!(Cli::try_parse_from(["cryptkv", "set", "/k", "v", "--file", "f"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "cryptkv",
            "list",
            "/app",
            "--backend",
            "consul",
            "--endpoint",
            "http://consul:8500",
            "--plaintext",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.overrides.backend, Some(BackendKind::Consul));
        assert_eq!(cli.overrides.endpoint.as_deref(), Some("http://consul:8500"));
        assert!(cli.overrides.plaintext);
    }

    #[test]
    fn parses_etcd_backend() {
        let cli = Cli::try_parse_from([
            "cryptkv",
            "--backend",
            "etcd",
            "--endpoint",
            "http://etcd1:2379,http://etcd2:2379",
            "get",
            "/k",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.overrides.backend, Some(BackendKind::Etcd));
    }

    #[test]
    fn keystore_conflicts_with_keyring() {
        assert!(
            Cli::try_parse_from(["cryptkv", "get", "/k", "--keystore", "k", "--keyring"]).is_err()
        );
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["cryptkv", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }
}
