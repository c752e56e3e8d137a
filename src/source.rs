//! The configuration-source facade.
//!
//! [`KvConfigSource`] ties the namespace, codec, backend client and
//! watch engine together behind the surface the generic configuration
//! layer consumes. Steady-state errors never escape it: failed reads
//! and writes log and degrade to absent/no-op, so configuration lookups
//! cannot fail at runtime. Only construction reports errors.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::access::ConfigAccessor;
use crate::backend::{BackendKind, KvBackend};
use crate::dispatch::ChangeDispatcher;
use crate::error::InitError;
use crate::key::{self, KeyCodec, PathStyle};
use crate::namespace::{resolve_namespace, DeploymentInfo};
use crate::settings::RetryDelays;
use crate::value;
use crate::watch::WatchEngine;

/// Key holding this source's priority among the host's configuration
/// sources.
const ORDINAL_KEY: &str = "config_ordinal";
const DEFAULT_ORDINAL: i32 = 110;

/// A remote key-value store serving as one configuration source.
pub struct KvConfigSource {
    backend: Arc<dyn KvBackend>,
    codec: KeyCodec,
    engine: WatchEngine,
    watches: DashMap<String, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl KvConfigSource {
    /// Resolve the namespace, read connection settings from the
    /// accessor and connect the chosen backend.
    ///
    /// A backend that cannot be *configured* (no hosts, malformed
    /// endpoint) fails here and the host decides whether that is
    /// fatal; a backend that is merely unreachable comes up degraded
    /// with a warning.
    pub async fn init(
        kind: BackendKind,
        deployment: &DeploymentInfo,
        accessor: Arc<dyn ConfigAccessor>,
        dispatcher: Arc<dyn ChangeDispatcher>,
    ) -> Result<Self, InitError> {
        let namespace = resolve_namespace(deployment, accessor.as_ref(), kind.name());
        let backend: Arc<dyn KvBackend> = match kind {
            #[cfg(feature = "consul")]
            BackendKind::Consul => {
                Arc::new(crate::backend::ConsulBackend::connect(accessor.as_ref()).await?)
            }
            #[cfg(feature = "etcd")]
            BackendKind::Etcd => {
                Arc::new(crate::backend::EtcdBackend::connect(accessor.as_ref()).await?)
            }
            #[cfg(feature = "zookeeper")]
            BackendKind::Zookeeper => {
                Arc::new(crate::backend::ZookeeperBackend::connect(accessor.as_ref()).await?)
            }
            #[allow(unreachable_patterns)]
            other => return Err(InitError::Unsupported {
                backend: other.name(),
            }),
        };
        let codec = KeyCodec::new(namespace, path_style(kind));
        Ok(Self::with_backend(backend, codec, accessor, dispatcher))
    }

    /// Wire the facade around an already-constructed backend. This is
    /// the seam tests and custom stores plug into.
    pub fn with_backend(
        backend: Arc<dyn KvBackend>,
        codec: KeyCodec,
        accessor: Arc<dyn ConfigAccessor>,
        dispatcher: Arc<dyn ChangeDispatcher>,
    ) -> Self {
        let delays = RetryDelays::resolve(accessor.as_ref(), backend.name());
        let (shutdown_tx, _) = broadcast::channel(1);
        let engine = WatchEngine::new(
            backend.clone(),
            codec.clone(),
            accessor,
            dispatcher,
            delays,
        );
        tracing::info!(
            backend = backend.name(),
            namespace = codec.namespace(),
            "Configuration source ready"
        );
        Self {
            backend,
            codec,
            engine,
            watches: DashMap::new(),
            shutdown_tx,
        }
    }

    /// The namespace all keys of this source live under.
    pub fn namespace(&self) -> &str {
        self.codec.namespace()
    }

    /// Fetch one value. Backend failures log and yield `None`.
    pub async fn get(&self, key: &str) -> Option<String> {
        let path = self.codec.encode(key);
        match self.backend.read(&path).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    key = key,
                    error = %error,
                    "Read failed"
                );
                None
            }
        }
    }

    pub async fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).await.as_deref().and_then(value::parse_bool)
    }

    pub async fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).await.as_deref().and_then(value::parse)
    }

    pub async fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).await.as_deref().and_then(value::parse)
    }

    pub async fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).await.as_deref().and_then(value::parse)
    }

    pub async fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).await.as_deref().and_then(value::parse)
    }

    /// Number of elements when the node's children form the contiguous
    /// list `0, 1, 2, ..`; `None` for a gap, a non-zero start, no
    /// children, or a backend without list support.
    pub async fn get_list_size(&self, key: &str) -> Option<usize> {
        if !self.backend.supports_list_size() {
            tracing::debug!(
                backend = self.backend.name(),
                key = key,
                "Backend does not support list size detection"
            );
            return None;
        }
        let children = self.children_of(key).await?;
        let indices = children
            .iter()
            .filter_map(|name| key::child_index(name))
            .collect();
        let run = key::contiguous_run(indices);
        if run >= 1 {
            Some(run)
        } else {
            None
        }
    }

    /// Immediate child names under a key, decoded to flat-key segments.
    pub async fn get_map_keys(&self, key: &str) -> Vec<String> {
        self.children_of(key).await.unwrap_or_default()
    }

    async fn children_of(&self, key: &str) -> Option<Vec<String>> {
        let path = self.codec.encode(key);
        match self.backend.list_children(&path).await {
            Ok(children) => Some(
                children
                    .iter()
                    .map(|name| self.codec.decode_child(name))
                    .collect(),
            ),
            Err(error) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    key = key,
                    error = %error,
                    "Child listing failed"
                );
                None
            }
        }
    }

    /// Write one value, serialized to its string form. Backend
    /// failures log and drop the write.
    pub async fn set<V: Display + Send>(&self, key: &str, value: V) {
        let raw = value.to_string();
        let path = self.codec.encode(key);
        if let Err(error) = self.backend.write(&path, &raw).await {
            tracing::warn!(
                backend = self.backend.name(),
                key = key,
                error = %error,
                "Write failed"
            );
        }
    }

    /// Start watching a key. The first call spawns the watch cycle;
    /// repeat calls for the same key are no-ops. Watches live until
    /// [`shutdown`](Self::shutdown).
    pub fn watch(&self, key: &str) {
        use dashmap::mapref::entry::Entry;
        match self.watches.entry(key.to_string()) {
            Entry::Occupied(_) => {
                tracing::debug!(key = key, "Key already watched");
            }
            Entry::Vacant(slot) => {
                let handle = self.engine.spawn(key.to_string(), self.shutdown_tx.subscribe());
                slot.insert(handle);
            }
        }
    }

    /// Number of keys currently watched.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// This source's priority among the host's configuration sources,
    /// read from the store itself (`config_ordinal`), defaulting to
    /// 110.
    pub async fn ordinal(&self) -> i32 {
        self.get_i32(ORDINAL_KEY).await.unwrap_or(DEFAULT_ORDINAL)
    }

    /// Signal every watch cycle to exit. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for KvConfigSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn path_style(kind: BackendKind) -> PathStyle {
    match kind {
        BackendKind::Consul => PathStyle::Consul,
        BackendKind::Etcd => PathStyle::Etcd2,
        BackendKind::Zookeeper => PathStyle::Zookeeper,
    }
}

/// The operation set the host's aggregation layer consumes, dyn-safe
/// so sources of different backends can sit in one priority list.
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    fn source_name(&self) -> &'static str;
    fn namespace(&self) -> &str;
    async fn get(&self, key: &str) -> Option<String>;
    async fn get_bool(&self, key: &str) -> Option<bool>;
    async fn get_i32(&self, key: &str) -> Option<i32>;
    async fn get_i64(&self, key: &str) -> Option<i64>;
    async fn get_f64(&self, key: &str) -> Option<f64>;
    async fn get_f32(&self, key: &str) -> Option<f32>;
    async fn get_list_size(&self, key: &str) -> Option<usize>;
    async fn get_map_keys(&self, key: &str) -> Vec<String>;
    async fn set(&self, key: &str, value: &str);
    fn watch(&self, key: &str);
    async fn ordinal(&self) -> i32;
    fn shutdown(&self);
}

#[async_trait]
impl ConfigurationSource for KvConfigSource {
    fn source_name(&self) -> &'static str {
        self.backend.name()
    }

    fn namespace(&self) -> &str {
        KvConfigSource::namespace(self)
    }

    async fn get(&self, key: &str) -> Option<String> {
        KvConfigSource::get(self, key).await
    }

    async fn get_bool(&self, key: &str) -> Option<bool> {
        KvConfigSource::get_bool(self, key).await
    }

    async fn get_i32(&self, key: &str) -> Option<i32> {
        KvConfigSource::get_i32(self, key).await
    }

    async fn get_i64(&self, key: &str) -> Option<i64> {
        KvConfigSource::get_i64(self, key).await
    }

    async fn get_f64(&self, key: &str) -> Option<f64> {
        KvConfigSource::get_f64(self, key).await
    }

    async fn get_f32(&self, key: &str) -> Option<f32> {
        KvConfigSource::get_f32(self, key).await
    }

    async fn get_list_size(&self, key: &str) -> Option<usize> {
        KvConfigSource::get_list_size(self, key).await
    }

    async fn get_map_keys(&self, key: &str) -> Vec<String> {
        KvConfigSource::get_map_keys(self, key).await
    }

    async fn set(&self, key: &str, value: &str) {
        KvConfigSource::set(self, key, value).await
    }

    fn watch(&self, key: &str) {
        KvConfigSource::watch(self, key)
    }

    async fn ordinal(&self) -> i32 {
        KvConfigSource::ordinal(self).await
    }

    fn shutdown(&self) {
        KvConfigSource::shutdown(self)
    }
}
