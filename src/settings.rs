//! Recognized configuration keys and connection settings.
//!
//! Backend connection parameters are read from the host's aggregated
//! configuration through [`ConfigAccessor`](crate::access::ConfigAccessor)
//! at initialization. Everything here is plain parsing; connectivity is
//! the backend adapters' business.

use std::time::Duration;

use base64::Engine;
use url::Url;

use crate::access::ConfigAccessor;

/// Universal namespace override.
pub const KEY_NAMESPACE: &str = "config.namespace";
/// Universal backoff floor, milliseconds.
pub const KEY_START_RETRY_DELAY: &str = "config.start-retry-delay-ms";
/// Universal backoff cap, milliseconds.
pub const KEY_MAX_RETRY_DELAY: &str = "config.max-retry-delay-ms";

pub const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_millis(900_000);

pub const DEFAULT_CONSUL_AGENT: &str = "http://localhost:8500";

/// Backend-scoped settings key: `config.<backend>.<setting>`.
pub fn backend_key(backend: &str, setting: &str) -> String {
    format!("config.{backend}.{setting}")
}

/// Watch reconnection delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelays {
    pub start: Duration,
    pub max: Duration,
}

impl Default for RetryDelays {
    fn default() -> Self {
        Self {
            start: DEFAULT_START_RETRY_DELAY,
            max: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl RetryDelays {
    /// Resolve the delay bounds for one backend. A universal key wins
    /// over the backend-specific one; anything unset falls back to the
    /// defaults (500 ms floor, 15 min cap).
    pub fn resolve(accessor: &dyn ConfigAccessor, backend: &str) -> Self {
        let start = accessor
            .get_i64(KEY_START_RETRY_DELAY)
            .or_else(|| accessor.get_i64(&backend_key(backend, "start-retry-delay-ms")))
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_START_RETRY_DELAY);
        let max = accessor
            .get_i64(KEY_MAX_RETRY_DELAY)
            .or_else(|| accessor.get_i64(&backend_key(backend, "max-retry-delay-ms")))
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MAX_RETRY_DELAY);
        Self {
            start,
            max: max.max(start),
        }
    }
}

/// The Consul agent endpoint. A malformed URL falls back to the local
/// agent default with a warning rather than failing init.
pub fn consul_agent(accessor: &dyn ConfigAccessor) -> Url {
    let configured = accessor
        .get(&backend_key("consul", "agent"))
        .unwrap_or_else(|| DEFAULT_CONSUL_AGENT.to_string());
    match Url::parse(&configured) {
        Ok(url) => url,
        Err(error) => {
            tracing::warn!(
                agent = %configured,
                error = %error,
                "Malformed Consul agent URL, using default"
            );
            Url::parse(DEFAULT_CONSUL_AGENT).expect("default agent URL parses")
        }
    }
}

/// Split a comma-separated host list, dropping empty entries.
///
/// Clusters of these stores vote; an even member count is legal but
/// weakens quorum, so it draws a warning.
pub fn host_list(accessor: &dyn ConfigAccessor, backend: &str) -> Vec<String> {
    let hosts: Vec<String> = accessor
        .get(&backend_key(backend, "hosts"))
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    if !hosts.is_empty() && hosts.len() % 2 == 0 {
        tracing::warn!(
            backend = backend,
            hosts = hosts.len(),
            "Even number of hosts configured; an odd count is recommended"
        );
    }
    hosts
}

/// Basic-auth credentials, present only when both parts are configured.
pub fn credentials(accessor: &dyn ConfigAccessor, backend: &str) -> Option<(String, String)> {
    let username = accessor.get(&backend_key(backend, "username"))?;
    let password = accessor.get(&backend_key(backend, "password"))?;
    Some((username, password))
}

/// Decode a configured CA certificate into DER bytes.
///
/// The value is PEM that may have survived transport through
/// configuration layers with mangled whitespace: marker lines and all
/// whitespace are stripped and the remaining base64 body is decoded.
pub fn ca_certificate_der(accessor: &dyn ConfigAccessor, backend: &str) -> Option<Vec<u8>> {
    let pem = accessor.get(&backend_key(backend, "ca"))?;
    let body: String = pem
        .lines()
        .filter(|line| !line.contains("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect();
    if body.is_empty() {
        return None;
    }
    match base64::engine::general_purpose::STANDARD.decode(&body) {
        Ok(der) => Some(der),
        Err(error) => {
            tracing::warn!(
                backend = backend,
                error = %error,
                "CA certificate is not valid base64, ignoring"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MapAccessor;

    #[test]
    fn test_retry_delay_precedence() {
        let accessor = MapAccessor::new()
            .with("config.start-retry-delay-ms", "100")
            .with("config.etcd.start-retry-delay-ms", "999")
            .with("config.etcd.max-retry-delay-ms", "5000");
        let delays = RetryDelays::resolve(&accessor, "etcd");
        assert_eq!(delays.start, Duration::from_millis(100));
        assert_eq!(delays.max, Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_delay_defaults() {
        let delays = RetryDelays::resolve(&MapAccessor::new(), "consul");
        assert_eq!(delays.start, DEFAULT_START_RETRY_DELAY);
        assert_eq!(delays.max, DEFAULT_MAX_RETRY_DELAY);
    }

    #[test]
    fn test_max_never_below_start() {
        let accessor = MapAccessor::new()
            .with("config.start-retry-delay-ms", "1000")
            .with("config.max-retry-delay-ms", "10");
        let delays = RetryDelays::resolve(&accessor, "consul");
        assert_eq!(delays.max, delays.start);
    }

    #[test]
    fn test_consul_agent_fallback() {
        let accessor = MapAccessor::new().with("config.consul.agent", "not a url");
        assert_eq!(consul_agent(&accessor).as_str(), "http://localhost:8500/");

        let accessor = MapAccessor::new().with("config.consul.agent", "https://consul:8501");
        assert_eq!(consul_agent(&accessor).as_str(), "https://consul:8501/");
    }

    #[test]
    fn test_host_list_parsing() {
        let accessor = MapAccessor::new()
            .with("config.etcd.hosts", "http://a:2379, http://b:2379 ,,http://c:2379");
        assert_eq!(
            host_list(&accessor, "etcd"),
            vec!["http://a:2379", "http://b:2379", "http://c:2379"]
        );
        assert!(host_list(&MapAccessor::new(), "etcd").is_empty());
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let accessor = MapAccessor::new().with("config.etcd.username", "root");
        assert_eq!(credentials(&accessor, "etcd"), None);

        let accessor = accessor.with("config.etcd.password", "hunter2");
        assert_eq!(
            credentials(&accessor, "etcd"),
            Some(("root".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn test_ca_certificate_stripping() {
        // "DER!" base64-encoded, wrapped and indented like a config
        // value that lost its formatting.
        let pem = "-----BEGIN CERTIFICATE-----\n  REVS\n IQ==\n-----END CERTIFICATE-----\n";
        let accessor = MapAccessor::new().with("config.etcd.ca", pem);
        assert_eq!(ca_certificate_der(&accessor, "etcd"), Some(b"DER!".to_vec()));

        let accessor = MapAccessor::new().with("config.etcd.ca", "not base64!!");
        assert_eq!(ca_certificate_der(&accessor, "etcd"), None);
    }
}
