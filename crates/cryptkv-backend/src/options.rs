use std::time::Duration;

/// Timing knobs for watch tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Delay between reads for polling watches.
    pub poll_interval: Duration,
    /// Delay before retrying after an error notification.
    pub error_backoff: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}
