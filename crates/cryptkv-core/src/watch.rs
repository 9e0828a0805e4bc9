//! Channel plumbing shared by every watch task.
//!
//! A watch task owns a [`Notifier`] and the caller owns the matching
//! [`WatchStream`]. The channel holds a single message so a slow consumer
//! stalls its producer, and every blocking point of the producer also waits on
//! the caller's stop token, so a task never outlives its stop signal and never
//! blocks forever on a consumer that went away.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::Response;

const WATCH_CHANNEL_CAPACITY: usize = 1;

/// Create a connected notifier/stream pair bound to `stop`.
pub fn watch_channel(stop: CancellationToken) -> (Notifier, WatchStream) {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    (Notifier { tx, stop }, WatchStream { rx })
}

/// Producer half held by a watch task.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Response>,
    stop: CancellationToken,
}

impl Notifier {
    /// Deliver one notification.
    ///
    /// Returns `false` when the stop token fired or the consumer dropped its
    /// stream; the task should exit in that case. A notification racing with
    /// stop may be dropped.
    pub async fn send(&self, response: Response) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.tx.send(response) => sent.is_ok(),
        }
    }

    /// Sleep for `delay` unless stopped first. Returns `false` if stopped.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// True once the stop token fired or the consumer is gone.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the stop token fires.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// The stop token this notifier is bound to.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}

/// Consumer half returned by `watch`.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::Receiver<Response>,
}

impl WatchStream {
    /// Wait for the next notification. `None` once the watch task has exited.
    pub async fn recv(&mut self) -> Option<Response> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`WatchStream::recv`].
    pub fn try_recv(&mut self) -> Option<Response> {
        self.rx.try_recv().ok()
    }
}
