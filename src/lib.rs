//! Remote configuration synchronization.
//!
//! `confsync` keeps a process's configuration current against a remote
//! hierarchical key-value store (Consul, etcd v2 or ZooKeeper) behind
//! one backend-agnostic surface.
//!
//! # Architecture Overview
//!
//! ```text
//!   flat key "db.pool[2].size"
//!        │
//!        ▼
//!   ┌──────────┐   ┌───────────┐
//!   │ KeyCodec │◀──│ namespace │  resolved once at init
//!   └────┬─────┘   └───────────┘
//!        │ path "environments/dev/services/config/db/pool/[2]/size"
//!        ▼
//!   ┌───────────────┐     ┌─────────────────────────────┐
//!   │ KvConfigSource│────▶│ KvBackend (consul/etcd/zk)  │──▶ remote store
//!   └──────┬────────┘     └─────────────────────────────┘
//!          │ watch(key)                 ▲
//!          ▼                            │ blocking_watch + backoff
//!   ┌──────────────┐                    │
//!   │ WatchEngine  │────────────────────┘
//!   └──────┬───────┘
//!          │ notify_change(key, value)
//!          ▼
//!   ChangeDispatcher (host)
//! ```
//!
//! Reads and writes are one-shot and degrade to absent/no-op on
//! failure; only the watch cycles retry, with doubling backoff, because
//! only they run unattended.

pub mod access;
pub mod backend;
pub mod dispatch;
pub mod error;
pub mod key;
pub mod namespace;
pub mod settings;
pub mod source;
pub mod value;
pub mod watch;

pub use access::{ConfigAccessor, MapAccessor};
pub use backend::{BackendKind, ChangeEvent, KvBackend, NodeState, WatchOutcome};
pub use dispatch::{ChangeDispatcher, ChannelDispatcher, ConfigUpdate};
pub use error::{BackendError, InitError};
pub use key::{KeyCodec, PathStyle};
pub use namespace::{resolve_namespace, DeploymentInfo};
pub use source::{ConfigurationSource, KvConfigSource};
