//! etcd v2 adapter.
//!
//! Speaks the v2 REST API: `GET`/`PUT /v2/keys/<path>` with
//! form-encoded writes, directory `nodes` for child enumeration, and
//! `?wait=true&waitIndex=<token>` long-polls for the watch primitive.
//! Requests fail over across the configured hosts.
//!
//! Known limitation carried over from the original deployment: list
//! size detection is not supported on this backend
//! ([`supports_list_size`](KvBackend::supports_list_size) is `false`).

use std::time::Duration;

use reqwest::RequestBuilder;
use serde::Deserialize;
use url::Url;

use crate::access::ConfigAccessor;
use crate::backend::{ChangeEvent, KvBackend, NodeState, WatchOutcome};
use crate::error::{BackendError, BackendResult, InitError};
use crate::settings;

/// Client-side bound on one long-poll; elapsing it is a quiet re-arm,
/// not a failure.
const WATCH_WINDOW: Duration = Duration::from_secs(120);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `errorCode` for a missing key.
const ERR_KEY_NOT_FOUND: u64 = 100;
/// `errorCode` for a waitIndex that fell out of the event history.
const ERR_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: Option<String>,
    node: Option<EtcdNode>,
    #[serde(rename = "errorCode")]
    error_code: Option<u64>,
    message: Option<String>,
    index: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(rename = "modifiedIndex")]
    modified_index: Option<u64>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

pub struct EtcdBackend {
    client: reqwest::Client,
    hosts: Vec<Url>,
    credentials: Option<(String, String)>,
}

impl EtcdBackend {
    /// Build a client for the configured cluster
    /// (`config.etcd.hosts`, comma-separated URLs). Credentials and a
    /// CA certificate are applied when configured. Fails when no host
    /// is usable; an unreachable cluster only logs a warning.
    pub async fn connect(accessor: &dyn ConfigAccessor) -> Result<Self, InitError> {
        let raw_hosts = settings::host_list(accessor, "etcd");
        if raw_hosts.is_empty() {
            return Err(InitError::NoHosts {
                backend: "etcd",
                key: "config.etcd.hosts",
            });
        }
        let mut hosts = Vec::with_capacity(raw_hosts.len());
        for raw in &raw_hosts {
            let url = Url::parse(raw).map_err(|e| InitError::InvalidEndpoint {
                backend: "etcd",
                endpoint: raw.clone(),
                reason: e.to_string(),
            })?;
            hosts.push(url);
        }

        let mut builder = reqwest::Client::builder();
        if let Some(der) = settings::ca_certificate_der(accessor, "etcd") {
            let certificate = reqwest::Certificate::from_der(&der)
                .map_err(|e| InitError::Client(format!("bad CA certificate: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|e| InitError::Client(e.to_string()))?;

        let backend = Self {
            client,
            hosts,
            credentials: settings::credentials(accessor, "etcd"),
        };
        match backend.probe().await {
            Ok(()) => tracing::info!(hosts = raw_hosts.len(), "etcd backend initialized"),
            Err(error) => tracing::warn!(
                error = %error,
                "etcd backend initialized but cluster probe failed"
            ),
        }
        Ok(backend)
    }

    async fn probe(&self) -> BackendResult<()> {
        let response = self
            .request(|host| {
                let url = join(host, "version")?;
                Ok(self.client.get(url).timeout(REQUEST_TIMEOUT))
            })
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!(
                "version probe returned {}",
                response.status()
            )))
        }
    }

    /// Issue one request, failing over across hosts on transport
    /// errors. Timeouts are transport errors here; the watch path
    /// handles its own timeout before calling this.
    async fn request<F>(&self, build: F) -> BackendResult<reqwest::Response>
    where
        F: Fn(&Url) -> BackendResult<RequestBuilder>,
    {
        let mut last_error = None;
        for (i, host) in self.hosts.iter().enumerate() {
            let mut builder = build(host)?;
            if let Some((username, password)) = &self.credentials {
                builder = builder.basic_auth(username, Some(password));
            }
            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::warn!(host_idx = i, error = %error, "etcd request failed, trying next host");
                    last_error = Some(error);
                }
            }
        }
        Err(BackendError::Unavailable(match last_error {
            Some(error) => error.to_string(),
            None => "no etcd hosts configured".to_string(),
        }))
    }

    async fn parse(response: reqwest::Response) -> BackendResult<EtcdResponse> {
        response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }

    /// Map a completed watch (or initial read) response onto the
    /// engine's outcome vocabulary.
    fn watch_outcome(path: &str, body: EtcdResponse, resume_token: u64) -> BackendResult<WatchOutcome> {
        if let Some(code) = body.error_code {
            return match code {
                // Node absent at the initial read.
                ERR_KEY_NOT_FOUND => Ok(WatchOutcome::Changed(ChangeEvent {
                    path: path.to_string(),
                    state: NodeState::Absent,
                    resume_token: body.index.map_or(resume_token, |i| i + 1),
                })),
                // Our waitIndex was compacted away. Reset the token; the
                // next cycle re-reads current state and resynchronizes.
                ERR_INDEX_CLEARED => {
                    tracing::debug!(path = path, "etcd index cleared, resynchronizing");
                    Ok(WatchOutcome::Unchanged { token: 0 })
                }
                _ => Err(BackendError::Protocol(format!(
                    "errorCode {code}: {}",
                    body.message.unwrap_or_default()
                ))),
            };
        }

        let node = body
            .node
            .ok_or_else(|| BackendError::Protocol("response without node".to_string()))?;
        let token = node.modified_index.map_or(resume_token, |i| i + 1);
        let deleted = matches!(
            body.action.as_deref(),
            Some("delete" | "expire" | "compareAndDelete")
        );
        let state = match (deleted, node.value) {
            (false, Some(value)) => NodeState::Present(value),
            _ => NodeState::Absent,
        };
        Ok(WatchOutcome::Changed(ChangeEvent {
            path: path.to_string(),
            state,
            resume_token: token,
        }))
    }
}

#[async_trait::async_trait]
impl KvBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn read(&self, path: &str) -> BackendResult<Option<String>> {
        let response = self
            .request(|host| {
                let url = join(host, &format!("v2/keys/{path}"))?;
                Ok(self.client.get(url).timeout(REQUEST_TIMEOUT))
            })
            .await?;
        let body = Self::parse(response).await?;
        match body.error_code {
            Some(ERR_KEY_NOT_FOUND) => Ok(None),
            Some(code) => Err(BackendError::Protocol(format!(
                "errorCode {code}: {}",
                body.message.unwrap_or_default()
            ))),
            None => Ok(body.node.and_then(|node| node.value)),
        }
    }

    async fn write(&self, path: &str, value: &str) -> BackendResult<()> {
        // etcd creates intermediate directories implicitly.
        let response = self
            .request(|host| {
                let url = join(host, &format!("v2/keys/{path}"))?;
                Ok(self
                    .client
                    .put(url)
                    .timeout(REQUEST_TIMEOUT)
                    .form(&[("value", value)]))
            })
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = Self::parse(response).await?;
            Err(BackendError::Protocol(format!(
                "write returned {status} (errorCode {:?}: {})",
                body.error_code,
                body.message.unwrap_or_default()
            )))
        }
    }

    async fn list_children(&self, path: &str) -> BackendResult<Vec<String>> {
        let response = self
            .request(|host| {
                let url = join(host, &format!("v2/keys/{path}"))?;
                Ok(self.client.get(url).timeout(REQUEST_TIMEOUT))
            })
            .await?;
        let body = Self::parse(response).await?;
        match body.error_code {
            Some(ERR_KEY_NOT_FOUND) => Ok(Vec::new()),
            Some(code) => Err(BackendError::Protocol(format!(
                "errorCode {code}: {}",
                body.message.unwrap_or_default()
            ))),
            None => {
                let node = body
                    .node
                    .ok_or_else(|| BackendError::Protocol("response without node".to_string()))?;
                if !node.dir {
                    return Ok(Vec::new());
                }
                Ok(node
                    .nodes
                    .iter()
                    .filter_map(|child| child.key.rsplit('/').next())
                    .map(str::to_string)
                    .collect())
            }
        }
    }

    async fn blocking_watch(&self, path: &str, resume_token: u64) -> BackendResult<WatchOutcome> {
        // Token 0 means nothing observed yet (or a cleared index):
        // deliver current state instead of waiting for the next edit.
        let wait = resume_token > 0;
        let mut last_error = None;
        for (i, host) in self.hosts.iter().enumerate() {
            let url = join(host, &format!("v2/keys/{path}"))?;
            let mut builder = self.client.get(url);
            if let Some((username, password)) = &self.credentials {
                builder = builder.basic_auth(username, Some(password));
            }
            builder = if wait {
                builder
                    .query(&[
                        ("wait", "true".to_string()),
                        ("waitIndex", resume_token.to_string()),
                    ])
                    .timeout(WATCH_WINDOW)
            } else {
                builder.timeout(REQUEST_TIMEOUT)
            };
            match builder.send().await {
                Ok(response) => {
                    return Self::watch_outcome(path, Self::parse(response).await?, resume_token)
                }
                // The bounded poll window elapsing without an event is
                // the normal quiet case, not a failure.
                Err(error) if wait && error.is_timeout() => {
                    return Ok(WatchOutcome::Unchanged { token: resume_token })
                }
                Err(error) => {
                    tracing::warn!(host_idx = i, error = %error, "etcd watch failed, trying next host");
                    last_error = Some(error);
                }
            }
        }
        Err(BackendError::Unavailable(
            last_error.map_or_else(|| "no etcd hosts configured".to_string(), |e| e.to_string()),
        ))
    }

    /// The original deployment never implemented list detection for
    /// etcd; reproduced as a documented limitation.
    fn supports_list_size(&self) -> bool {
        false
    }
}

fn join(host: &Url, suffix: &str) -> BackendResult<Url> {
    // Segments are already percent-encoded by the codec; parsing the
    // assembled string preserves them as-is.
    let base = host.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/{suffix}"))
        .map_err(|e| BackendError::Protocol(format!("bad request URL: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> EtcdResponse {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_set_event_maps_to_present() {
        let body = parse(
            r#"{"action":"set","node":{"key":"/ns/feature/flag","value":"false",
                "modifiedIndex":21,"createdIndex":20}}"#,
        );
        let outcome = EtcdBackend::watch_outcome("ns/feature/flag", body, 10).unwrap();
        assert_eq!(
            outcome,
            WatchOutcome::Changed(ChangeEvent {
                path: "ns/feature/flag".to_string(),
                state: NodeState::Present("false".to_string()),
                resume_token: 22,
            })
        );
    }

    #[test]
    fn test_delete_event_maps_to_absent() {
        let body = parse(
            r#"{"action":"delete","node":{"key":"/ns/feature/flag","modifiedIndex":23,
                "createdIndex":20},"prevNode":{"key":"/ns/feature/flag","value":"false",
                "modifiedIndex":21,"createdIndex":20}}"#,
        );
        let outcome = EtcdBackend::watch_outcome("ns/feature/flag", body, 22).unwrap();
        assert_eq!(
            outcome,
            WatchOutcome::Changed(ChangeEvent {
                path: "ns/feature/flag".to_string(),
                state: NodeState::Absent,
                resume_token: 24,
            })
        );
    }

    #[test]
    fn test_missing_key_is_absent_with_advanced_token() {
        let body = parse(r#"{"errorCode":100,"message":"Key not found","cause":"/ns/x","index":8}"#);
        let outcome = EtcdBackend::watch_outcome("ns/x", body, 0).unwrap();
        assert_eq!(
            outcome,
            WatchOutcome::Changed(ChangeEvent {
                path: "ns/x".to_string(),
                state: NodeState::Absent,
                resume_token: 9,
            })
        );
    }

    #[test]
    fn test_cleared_index_resets_token() {
        let body = parse(
            r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared",
                "cause":"the requested history has been cleared [1008/8]","index":2007}"#,
        );
        let outcome = EtcdBackend::watch_outcome("ns/x", body, 8).unwrap();
        assert_eq!(outcome, WatchOutcome::Unchanged { token: 0 });
    }

    #[test]
    fn test_unknown_error_code_is_protocol_error() {
        let body = parse(r#"{"errorCode":105,"message":"Key already exists","index":3}"#);
        assert!(matches!(
            EtcdBackend::watch_outcome("ns/x", body, 0),
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn test_directory_listing() {
        let body = parse(
            r#"{"action":"get","node":{"key":"/ns/db/pool","dir":true,"modifiedIndex":4,
                "nodes":[{"key":"/ns/db/pool/%5B0%5D","value":"a","modifiedIndex":5},
                         {"key":"/ns/db/pool/%5B1%5D","value":"b","modifiedIndex":6}]}}"#,
        );
        let node = body.node.unwrap();
        let names: Vec<&str> = node
            .nodes
            .iter()
            .filter_map(|c| c.key.rsplit('/').next())
            .collect();
        assert_eq!(names, vec!["%5B0%5D", "%5B1%5D"]);
    }
}
