//! Consul KV adapter.
//!
//! Speaks the agent's HTTP API: `GET`/`PUT /v1/kv/<path>` with base64
//! values in the JSON response, child enumeration via
//! `?keys&separator=/`, and blocking queries driven by the
//! `X-Consul-Index` header for the watch primitive.

use std::time::Duration;

use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::access::ConfigAccessor;
use crate::backend::{ChangeEvent, KvBackend, NodeState, WatchOutcome};
use crate::error::{BackendError, BackendResult, InitError};
use crate::settings;

/// Server-side hold time for blocking queries.
const WATCH_WAIT: Duration = Duration::from_secs(120);
/// Timeout for one-shot reads, writes and listings.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of a `/v1/kv` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    #[allow(dead_code)]
    key: String,
    value: Option<String>,
    modify_index: u64,
}

pub struct ConsulBackend {
    client: reqwest::Client,
    agent: Url,
}

impl ConsulBackend {
    /// Connect to the configured agent (`config.consul.agent`, default
    /// local) and probe it. An unreachable agent logs a warning but
    /// does not fail construction; operations degrade until it comes
    /// back.
    pub async fn connect(accessor: &dyn ConfigAccessor) -> Result<Self, InitError> {
        let agent = settings::consul_agent(accessor);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| InitError::Client(e.to_string()))?;
        let backend = Self { client, agent };

        match backend.probe().await {
            Ok(()) => {
                tracing::info!(agent = %backend.agent, "Consul backend initialized");
            }
            Err(error) => {
                tracing::warn!(
                    agent = %backend.agent,
                    error = %error,
                    "Consul backend initialized but agent probe failed"
                );
            }
        }
        Ok(backend)
    }

    async fn probe(&self) -> BackendResult<()> {
        let url = self.endpoint("v1/status/leader")?;
        let response = self
            .client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!(
                "agent probe returned {}",
                response.status()
            )))
        }
    }

    fn endpoint(&self, suffix: &str) -> BackendResult<Url> {
        self.agent
            .join(suffix)
            .map_err(|e| BackendError::Protocol(format!("bad request URL: {e}")))
    }

    fn kv_url(&self, path: &str) -> BackendResult<Url> {
        self.endpoint(&format!("v1/kv/{path}"))
    }

    fn decode_value(entry: &KvEntry) -> BackendResult<String> {
        match &entry.value {
            // A null Value is an existing node holding the empty string.
            None => Ok(String::new()),
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| BackendError::Protocol(format!("value is not base64: {e}")))
                .and_then(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|e| BackendError::Protocol(format!("value is not UTF-8: {e}")))
                }),
        }
    }

    fn consul_index(response: &reqwest::Response) -> Option<u64> {
        response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

#[async_trait::async_trait]
impl KvBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn read(&self, path: &str) -> BackendResult<Option<String>> {
        let response = self
            .client
            .get(self.kv_url(path)?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let entries: Vec<KvEntry> = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                match entries.first() {
                    Some(entry) => Ok(Some(Self::decode_value(entry)?)),
                    None => Ok(None),
                }
            }
            status => Err(BackendError::Protocol(format!("read returned {status}"))),
        }
    }

    async fn write(&self, path: &str, value: &str) -> BackendResult<()> {
        // Consul creates the hierarchy implicitly; one PUT suffices.
        let response = self
            .client
            .put(self.kv_url(path)?)
            .timeout(REQUEST_TIMEOUT)
            .body(value.to_string())
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!(
                "write returned {}",
                response.status()
            )))
        }
    }

    async fn list_children(&self, path: &str) -> BackendResult<Vec<String>> {
        let response = self
            .client
            .get(self.kv_url(&format!("{path}/"))?)
            .query(&[("keys", ""), ("separator", "/")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let keys: Vec<String> = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                let prefix = format!("{path}/");
                let mut children: Vec<String> = keys
                    .iter()
                    .filter_map(|key| key.strip_prefix(&prefix))
                    .map(|rest| rest.trim_end_matches('/').to_string())
                    .filter(|name| !name.is_empty())
                    .collect();
                children.dedup();
                Ok(children)
            }
            status => Err(BackendError::Protocol(format!("list returned {status}"))),
        }
    }

    async fn blocking_watch(&self, path: &str, resume_token: u64) -> BackendResult<WatchOutcome> {
        // Client-side timeout per the blocking-query guidance:
        // wait + wait/16 + slack for the round trip.
        let timeout = WATCH_WAIT + WATCH_WAIT / 16 + Duration::from_secs(1);
        let response = self
            .client
            .get(self.kv_url(path)?)
            .query(&[
                ("index", resume_token.to_string()),
                ("wait", format!("{}s", WATCH_WAIT.as_secs())),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let new_token = Self::consul_index(&response).ok_or_else(|| {
            BackendError::Protocol("blocking query response lacks X-Consul-Index".to_string())
        })?;

        match response.status() {
            // The node does not exist; the index still advances when it
            // is deleted, so an unchanged index is just the hold timer.
            StatusCode::NOT_FOUND => {
                if new_token == resume_token {
                    Ok(WatchOutcome::Unchanged { token: new_token })
                } else {
                    Ok(WatchOutcome::Changed(ChangeEvent {
                        path: path.to_string(),
                        state: NodeState::Absent,
                        resume_token: new_token,
                    }))
                }
            }
            status if status.is_success() => {
                if new_token == resume_token {
                    return Ok(WatchOutcome::Unchanged { token: new_token });
                }
                let entries: Vec<KvEntry> = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                let entry = entries.first().ok_or_else(|| {
                    BackendError::Protocol("blocking query returned an empty entry list".to_string())
                })?;
                Ok(WatchOutcome::Changed(ChangeEvent {
                    path: path.to_string(),
                    state: NodeState::Present(Self::decode_value(entry)?),
                    resume_token: new_token.max(entry.modify_index),
                }))
            }
            status => Err(BackendError::Protocol(format!("watch returned {status}"))),
        }
    }
}

fn transport_error(error: reqwest::Error) -> BackendError {
    BackendError::Unavailable(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_decoding() {
        let raw = r#"[{"LockIndex":0,"Key":"ns/feature/flag","Flags":0,
            "Value":"dHJ1ZQ==","CreateIndex":5,"ModifyIndex":12}]"#;
        let entries: Vec<KvEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].modify_index, 12);
        assert_eq!(ConsulBackend::decode_value(&entries[0]).unwrap(), "true");
    }

    #[test]
    fn test_null_value_is_empty_string() {
        let raw = r#"[{"Key":"ns/empty","Value":null,"ModifyIndex":3}]"#;
        let entries: Vec<KvEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(ConsulBackend::decode_value(&entries[0]).unwrap(), "");
    }

    #[test]
    fn test_garbage_value_is_protocol_error() {
        let raw = r#"[{"Key":"ns/bad","Value":"!!","ModifyIndex":3}]"#;
        let entries: Vec<KvEntry> = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            ConsulBackend::decode_value(&entries[0]),
            Err(BackendError::Protocol(_))
        ));
    }
}
