//! ZooKeeper adapter.
//!
//! Wraps the async `zookeeper-client` crate. ZooKeeper watches are
//! one-shot callbacks; this adapter re-expresses them as the engine's
//! blocking-call contract by arming a one-shot watcher and awaiting it
//! inside `blocking_watch`, so exactly one watch is in flight per key.
//! The resume token is the node's `mzxid` (0 = never observed/absent);
//! a mismatch at arm time is delivered as an immediate change.
//!
//! Unlike Consul and etcd, nodes must be created explicitly, so writes
//! build the ancestor chain before touching the leaf.

use zookeeper_client as zk;

use crate::access::ConfigAccessor;
use crate::backend::{ChangeEvent, KvBackend, NodeState, WatchOutcome};
use crate::error::{BackendError, BackendResult, InitError};
use crate::settings;

pub struct ZookeeperBackend {
    client: zk::Client,
}

impl ZookeeperBackend {
    /// Connect to the configured ensemble (`config.zookeeper.hosts`,
    /// comma-separated `host:port`). Session establishment happens
    /// here; a cluster that cannot be reached fails construction and
    /// the host decides whether that is fatal.
    pub async fn connect(accessor: &dyn ConfigAccessor) -> Result<Self, InitError> {
        let hosts = settings::host_list(accessor, "zookeeper");
        if hosts.is_empty() {
            return Err(InitError::NoHosts {
                backend: "zookeeper",
                key: "config.zookeeper.hosts",
            });
        }
        let client = zk::Client::connect(&hosts.join(","))
            .await
            .map_err(|e| InitError::Client(e.to_string()))?;
        tracing::info!(hosts = hosts.len(), "ZooKeeper backend initialized");
        Ok(Self { client })
    }

    /// Create every ancestor of `path` that does not exist yet. Not
    /// transactional with the leaf write that follows.
    async fn create_ancestors(&self, path: &str) -> BackendResult<()> {
        let parents: Vec<&str> = path
            .char_indices()
            .filter(|&(i, c)| c == '/' && i > 0)
            .map(|(i, _)| &path[..i])
            .collect();
        for parent in parents {
            self.create_node(parent, b"").await?;
        }
        Ok(())
    }

    async fn create_node(&self, path: &str, data: &[u8]) -> BackendResult<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        match self.client.create(path, data, &options).await {
            Ok(_) => Ok(()),
            Err(zk::Error::NodeExists) => Ok(()),
            Err(error) => Err(map_error(error)),
        }
    }

    async fn read_current(&self, path: &str, fallback_token: u64) -> BackendResult<WatchOutcome> {
        match self.client.get_data(path).await {
            Ok((data, stat)) => Ok(WatchOutcome::Changed(ChangeEvent {
                path: path.to_string(),
                state: NodeState::Present(utf8(data)?),
                resume_token: stat.mzxid as u64,
            })),
            // Deleted between the watch firing and the re-read.
            Err(zk::Error::NoNode) => Ok(WatchOutcome::Changed(ChangeEvent {
                path: path.to_string(),
                state: NodeState::Absent,
                resume_token: fallback_token,
            })),
            Err(error) => Err(map_error(error)),
        }
    }
}

#[async_trait::async_trait]
impl KvBackend for ZookeeperBackend {
    fn name(&self) -> &'static str {
        "zookeeper"
    }

    async fn read(&self, path: &str) -> BackendResult<Option<String>> {
        match self.client.get_data(path).await {
            Ok((data, _stat)) => Ok(Some(utf8(data)?)),
            Err(zk::Error::NoNode) => Ok(None),
            Err(error) => Err(map_error(error)),
        }
    }

    async fn write(&self, path: &str, value: &str) -> BackendResult<()> {
        // Upsert: the set fails fast when the node is missing, then the
        // hierarchy is built and the leaf created (or set again when a
        // concurrent writer won the create).
        match self.client.set_data(path, value.as_bytes(), None).await {
            Ok(_) => Ok(()),
            Err(zk::Error::NoNode) => {
                self.create_ancestors(path).await?;
                match self.client.create(
                    path,
                    value.as_bytes(),
                    &zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all()),
                ).await {
                    Ok(_) => Ok(()),
                    Err(zk::Error::NodeExists) => self
                        .client
                        .set_data(path, value.as_bytes(), None)
                        .await
                        .map(|_| ())
                        .map_err(map_error),
                    Err(error) => Err(map_error(error)),
                }
            }
            Err(error) => Err(map_error(error)),
        }
    }

    async fn list_children(&self, path: &str) -> BackendResult<Vec<String>> {
        match self.client.list_children(path).await {
            Ok(children) => Ok(children),
            Err(zk::Error::NoNode) => Ok(Vec::new()),
            Err(error) => Err(map_error(error)),
        }
    }

    async fn blocking_watch(&self, path: &str, resume_token: u64) -> BackendResult<WatchOutcome> {
        match self.client.get_and_watch_data(path).await {
            Ok((data, stat, watcher)) => {
                let mzxid = stat.mzxid as u64;
                if mzxid != resume_token {
                    // State moved while no watch was armed (or this is
                    // the first cycle): deliver it now.
                    drop(watcher);
                    return Ok(WatchOutcome::Changed(ChangeEvent {
                        path: path.to_string(),
                        state: NodeState::Present(utf8(data)?),
                        resume_token: mzxid,
                    }));
                }
                let _event = watcher.changed().await;
                match self.read_current(path, 0).await? {
                    // Session-level events fire the watcher without a
                    // data change; a quiet re-arm.
                    WatchOutcome::Changed(event) if event.resume_token == resume_token => {
                        Ok(WatchOutcome::Unchanged { token: resume_token })
                    }
                    outcome => Ok(outcome),
                }
            }
            Err(zk::Error::NoNode) => {
                match self.client.check_and_watch_stat(path).await {
                    // Created between the two calls.
                    Ok((Some(_), watcher)) => {
                        drop(watcher);
                        self.read_current(path, resume_token).await
                    }
                    Ok((None, watcher)) => {
                        if resume_token != 0 {
                            // First observation of the deletion.
                            drop(watcher);
                            return Ok(WatchOutcome::Changed(ChangeEvent {
                                path: path.to_string(),
                                state: NodeState::Absent,
                                resume_token: 0,
                            }));
                        }
                        let _event = watcher.changed().await;
                        match self.read_current(path, 0).await? {
                            WatchOutcome::Changed(ChangeEvent {
                                state: NodeState::Absent,
                                ..
                            }) => Ok(WatchOutcome::Unchanged { token: 0 }),
                            outcome => Ok(outcome),
                        }
                    }
                    Err(error) => Err(map_error(error)),
                }
            }
            Err(error) => Err(map_error(error)),
        }
    }
}

fn utf8(data: Vec<u8>) -> BackendResult<String> {
    String::from_utf8(data).map_err(|e| BackendError::Protocol(format!("value is not UTF-8: {e}")))
}

/// The session is the unit of liveness: an expired or closed session
/// can never recover, everything else retries.
fn map_error(error: zk::Error) -> BackendError {
    match error {
        zk::Error::SessionExpired | zk::Error::ClientClosed => {
            BackendError::Fatal(error.to_string())
        }
        zk::Error::ConnectionLoss | zk::Error::OperationTimeout => {
            BackendError::Unavailable(error.to_string())
        }
        other => BackendError::Protocol(other.to_string()),
    }
}
