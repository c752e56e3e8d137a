//! Backend capability interface.
//!
//! Each remote store implements [`KvBackend`]: four thin operations over
//! an already-established connection. Everything above this trait
//! (namespace handling, key encoding, retry and backoff, fallback on
//! deletion) is backend-agnostic and lives in the watch engine and the
//! facade.

use async_trait::async_trait;

use crate::error::BackendResult;

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "etcd")]
pub mod etcd;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

#[cfg(feature = "consul")]
pub use consul::ConsulBackend;
#[cfg(feature = "etcd")]
pub use etcd::EtcdBackend;
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZookeeperBackend;

/// The remote stores this crate can synchronize from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Consul,
    Etcd,
    Zookeeper,
}

impl BackendKind {
    /// Name used in settings keys, logs and metrics labels.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Consul => "consul",
            BackendKind::Etcd => "etcd",
            BackendKind::Zookeeper => "zookeeper",
        }
    }
}

/// Whether the watched node held a value when the watch completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Present(String),
    Absent,
}

/// One observed change on a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The backend path the change applies to.
    pub path: String,
    /// The node's state after the change.
    pub state: NodeState,
    /// Token to resume watching from; passing it back to
    /// [`KvBackend::blocking_watch`] observes strictly later changes.
    pub resume_token: u64,
}

/// Result of one completed blocking watch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The node changed (or its current state was delivered on the
    /// first call).
    Changed(ChangeEvent),
    /// The bounded wait elapsed without a change; re-arm with `token`.
    Unchanged { token: u64 },
}

/// Thin synchronous operations against one remote store.
///
/// Implementations are internally synchronized: concurrent calls on
/// different paths must not corrupt each other. None of these retry:
/// the watch engine owns retry for watches, the caller for the rest.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Backend name for logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Fetch a single value. `Ok(None)` when the node does not exist.
    async fn read(&self, path: &str) -> BackendResult<Option<String>>;

    /// Write a leaf value, creating intermediate hierarchy nodes first
    /// where the store requires them. Not transactional across the
    /// hierarchy creation and the leaf write.
    async fn write(&self, path: &str, value: &str) -> BackendResult<()>;

    /// Immediate child names of a node, raw as the store reports them.
    /// `Ok(vec![])` when the node does not exist or has no children.
    async fn list_children(&self, path: &str) -> BackendResult<Vec<String>>;

    /// Block until the node changes past `resume_token`, the bounded
    /// wait elapses, or the connection fails.
    async fn blocking_watch(&self, path: &str, resume_token: u64) -> BackendResult<WatchOutcome>;

    /// Whether list-size detection over children is meaningful for this
    /// store. The etcd adapter answers `false`: its `get_list_size` is
    /// unconditionally absent, a documented limitation.
    fn supports_list_size(&self) -> bool {
        true
    }
}
