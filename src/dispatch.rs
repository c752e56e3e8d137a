//! Change notification fan-out.
//!
//! The watch engine pushes `(flat_key, new_value)` pairs to whatever the
//! host binds behind [`ChangeDispatcher`]. A channel-backed
//! implementation is provided for hosts that consume updates from a task
//! of their own, and for tests.

use tokio::sync::mpsc;

/// A single configuration change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// Flat dot-separated key, decoded from the backend path.
    pub key: String,
    /// The new value, or the fallback value when the remote node was
    /// deleted.
    pub value: String,
}

/// Receives change notifications from watch cycles.
///
/// Called zero or more times per watched key for the lifetime of the
/// process. Implementations must tolerate concurrent calls from
/// different watch tasks; calls for the same key arrive in backend
/// order.
pub trait ChangeDispatcher: Send + Sync {
    fn notify_change(&self, key: &str, value: &str);
}

/// Dispatcher delivering updates over an unbounded channel.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<ConfigUpdate>,
}

impl ChannelDispatcher {
    /// Create the dispatcher and the receiving end for the host.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConfigUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChangeDispatcher for ChannelDispatcher {
    fn notify_change(&self, key: &str, value: &str) {
        // A dropped receiver means the host stopped listening; updates
        // are simply discarded from then on.
        let _ = self.tx.send(ConfigUpdate {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
}
