use std::sync::{Arc, Mutex};

use tracing::Level;

/// Observer for backend-internal diagnostics (reconnects, poll failures, ...).
/// Purely a side channel: it never influences data-path results.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Default logger forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "cryptkv::backend", "{message}"),
            Level::WARN => tracing::warn!(target: "cryptkv::backend", "{message}"),
            Level::INFO => tracing::info!(target: "cryptkv::backend", "{message}"),
            Level::DEBUG => tracing::debug!(target: "cryptkv::backend", "{message}"),
            _ => tracing::trace!(target: "cryptkv::backend", "{message}"),
        }
    }
}

/// Logger that keeps every message in memory. Handy in tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingLogger {
    inner: Arc<Mutex<Vec<(Level, String)>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded messages, oldest first.
    pub fn messages(&self) -> Vec<(Level, String)> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(_, msg)| msg.contains(needle))
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Level, message: &str) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((level, message.to_string()));
    }
}

/// Swappable logger slot held by adapters.
pub struct LoggerSlot {
    inner: std::sync::RwLock<Arc<dyn Logger>>,
}

impl LoggerSlot {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: std::sync::RwLock::new(logger),
        }
    }

    pub fn replace(&self, logger: Arc<dyn Logger>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = logger;
    }

    pub fn get(&self) -> Arc<dyn Logger> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn log(&self, level: Level, message: &str) {
        self.get().log(level, message);
    }
}

impl Default for LoggerSlot {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

impl std::fmt::Debug for LoggerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerSlot").finish_non_exhaustive()
    }
}
