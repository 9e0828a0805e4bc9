//! Core contracts for cryptkv: the backend `Store` trait, error kinds, and the
//! watch plumbing shared by every adapter and manager. Adapters live in
//! `cryptkv-backend`; nothing here talks to a network.

pub mod error;
pub mod logger;
pub mod path;
pub mod store;
pub mod watch;

pub use error::{key_not_found, StoreError};
pub use logger::{Logger, LoggerSlot, RecordingLogger, TracingLogger};
pub use store::{KvPair, KvPairs, Response, Store};
pub use watch::{watch_channel, Notifier, WatchStream};
pub use tokio_util::sync::CancellationToken;
