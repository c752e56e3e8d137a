//! The per-key watch cycle.
//!
//! One task per watched key runs the same loop regardless of backend:
//! issue a blocking watch, interpret the outcome, deliver or fall back,
//! re-arm. Connection failures re-arm after an exponentially growing
//! delay; any completed call resets the delay to its floor.
//!
//! Cycle state (resume token, backoff delay, deleted flag) is private
//! to the task; watches only share the read-only codec and the backend
//! client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::access::ConfigAccessor;
use crate::backend::{ChangeEvent, KvBackend, NodeState, WatchOutcome};
use crate::dispatch::ChangeDispatcher;
use crate::error::BackendError;
use crate::key::KeyCodec;
use crate::settings::RetryDelays;

/// Deterministic doubling backoff between reconnection attempts.
#[derive(Debug, Clone)]
pub struct RetryDelay {
    bounds: RetryDelays,
    current: Duration,
}

impl RetryDelay {
    pub fn new(bounds: RetryDelays) -> Self {
        Self {
            bounds,
            current: bounds.start,
        }
    }

    /// The delay to sleep before the next attempt; doubles the stored
    /// delay for the attempt after, capped at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (delay * 2).min(self.bounds.max);
        delay
    }

    /// Back to the floor, called on any successful exchange.
    pub fn reset(&mut self) {
        self.current = self.bounds.start;
    }
}

/// Spawns and parameterizes watch cycles. Shared by all keys of one
/// configuration source.
pub struct WatchEngine {
    backend: Arc<dyn KvBackend>,
    codec: KeyCodec,
    accessor: Arc<dyn ConfigAccessor>,
    dispatcher: Arc<dyn ChangeDispatcher>,
    delays: RetryDelays,
}

impl WatchEngine {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        codec: KeyCodec,
        accessor: Arc<dyn ConfigAccessor>,
        dispatcher: Arc<dyn ChangeDispatcher>,
        delays: RetryDelays,
    ) -> Self {
        Self {
            backend,
            codec,
            accessor,
            dispatcher,
            delays,
        }
    }

    /// Start the watch cycle for one key. The task runs until the
    /// shutdown signal fires or the backend reports a fatal error.
    pub fn spawn(&self, key: String, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cycle = WatchCycle {
            backend: self.backend.clone(),
            codec: self.codec.clone(),
            accessor: self.accessor.clone(),
            dispatcher: self.dispatcher.clone(),
            path: self.codec.encode(&key),
            key,
            resume_token: 0,
            delay: RetryDelay::new(self.delays),
            deleted: false,
        };
        tokio::spawn(cycle.run(shutdown))
    }
}

struct WatchCycle {
    backend: Arc<dyn KvBackend>,
    codec: KeyCodec,
    accessor: Arc<dyn ConfigAccessor>,
    dispatcher: Arc<dyn ChangeDispatcher>,
    key: String,
    path: String,
    resume_token: u64,
    delay: RetryDelay,
    deleted: bool,
}

impl WatchCycle {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(backend = self.backend.name(), key = %self.key, path = %self.path, "Watch started");
        loop {
            let result = tokio::select! {
                result = self.backend.blocking_watch(&self.path, self.resume_token) => result,
                _ = shutdown.recv() => {
                    tracing::debug!(key = %self.key, "Watch received shutdown signal, exiting");
                    return;
                }
            };

            match result {
                Ok(WatchOutcome::Unchanged { token }) => {
                    // The hold timer elapsed with nothing to report.
                    self.resume_token = token;
                    self.delay.reset();
                }
                Ok(WatchOutcome::Changed(event)) => {
                    self.resume_token = event.resume_token;
                    self.delay.reset();
                    self.handle_change(event);
                }
                Err(BackendError::Unavailable(error)) => {
                    let delay = self.delay.next_delay();
                    tracing::warn!(
                        backend = self.backend.name(),
                        key = %self.key,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Watch connection failed, backing off"
                    );
                    metrics::counter!(
                        "confsync_watch_reconnects_total",
                        "backend" => self.backend.name()
                    )
                    .increment(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            tracing::debug!(key = %self.key, "Watch received shutdown signal, exiting");
                            return;
                        }
                    }
                }
                Err(BackendError::Protocol(error)) => {
                    tracing::warn!(
                        backend = self.backend.name(),
                        key = %self.key,
                        error = %error,
                        "Watch got a malformed response, re-arming"
                    );
                }
                Err(BackendError::Fatal(error)) => {
                    tracing::error!(
                        backend = self.backend.name(),
                        key = %self.key,
                        error = %error,
                        "Watch hit an unrecoverable error, giving up on this key"
                    );
                    metrics::counter!(
                        "confsync_watch_failures_total",
                        "backend" => self.backend.name()
                    )
                    .increment(1);
                    return;
                }
            }
        }
    }

    fn handle_change(&mut self, event: ChangeEvent) {
        match event.state {
            NodeState::Present(value) => {
                // Decode from the reported path; a path from outside
                // our namespace should not happen on a per-key watch.
                let key = match self.codec.decode(&event.path) {
                    Some(key) => key,
                    None => {
                        tracing::warn!(path = %event.path, "Change event outside namespace, using watched key");
                        self.key.clone()
                    }
                };
                self.deleted = false;
                tracing::info!(
                    backend = self.backend.name(),
                    key = %key,
                    token = event.resume_token,
                    "Configuration changed"
                );
                self.dispatcher.notify_change(&key, &value);
                metrics::counter!(
                    "confsync_notifications_total",
                    "backend" => self.backend.name()
                )
                .increment(1);
            }
            NodeState::Absent => {
                if self.deleted {
                    // Still gone; one fallback notification per
                    // contiguous absent run is enough.
                    tracing::debug!(key = %self.key, "Node still absent, suppressing notification");
                    return;
                }
                self.deleted = true;
                match self.accessor.get(&self.key) {
                    Some(fallback) => {
                        tracing::info!(
                            backend = self.backend.name(),
                            key = %self.key,
                            "Node deleted, notifying fallback value"
                        );
                        self.dispatcher.notify_change(&self.key, &fallback);
                        metrics::counter!(
                            "confsync_notifications_total",
                            "backend" => self.backend.name()
                        )
                        .increment(1);
                    }
                    None => {
                        tracing::info!(
                            backend = self.backend.name(),
                            key = %self.key,
                            "Node deleted and no fallback value available"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(start_ms: u64, max_ms: u64) -> RetryDelays {
        RetryDelays {
            start: Duration::from_millis(start_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let mut delay = RetryDelay::new(bounds(500, 3000));
        assert_eq!(delay.next_delay(), Duration::from_millis(500));
        assert_eq!(delay.next_delay(), Duration::from_millis(1000));
        assert_eq!(delay.next_delay(), Duration::from_millis(2000));
        assert_eq!(delay.next_delay(), Duration::from_millis(3000));
        assert_eq!(delay.next_delay(), Duration::from_millis(3000));
    }

    #[test]
    fn test_delay_is_monotonic_until_reset() {
        let mut delay = RetryDelay::new(bounds(500, 900_000));
        let mut previous = Duration::ZERO;
        for _ in 0..24 {
            let next = delay.next_delay();
            assert!(next >= previous);
            assert!(next <= Duration::from_millis(900_000));
            previous = next;
        }
        delay.reset();
        assert_eq!(delay.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_degenerate_bounds() {
        // Floor equal to cap stays pinned there.
        let mut delay = RetryDelay::new(bounds(100, 100));
        assert_eq!(delay.next_delay(), Duration::from_millis(100));
        assert_eq!(delay.next_delay(), Duration::from_millis(100));
    }
}
