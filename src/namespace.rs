//! Deployment namespace resolution.
//!
//! Every key this crate reads or writes lives under a single root path,
//! resolved once at initialization and immutable afterwards. Overrides
//! win over the environment-derived formula, and a universal override
//! wins over a backend-specific one.

use serde::{Deserialize, Serialize};

use crate::access::ConfigAccessor;
use crate::settings;

/// Identity of the deployment this process belongs to.
///
/// Fields left `None` fall back to the aggregated configuration
/// (`env`, `service.name`, `service.version`) and then to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Environment name (`dev`, `staging`, `prod`, ..).
    pub environment: Option<String>,
    /// Service name, when configuration is scoped per service.
    pub service_name: Option<String>,
    /// Service version, only meaningful alongside a service name.
    pub service_version: Option<String>,
}

impl DeploymentInfo {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: Some(environment.into()),
            ..Self::default()
        }
    }

    /// Builder-style service identity.
    pub fn with_service(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self.service_version = Some(version.into());
        self
    }
}

const DEFAULT_ENVIRONMENT: &str = "dev";
const DEFAULT_VERSION: &str = "1.0.0";

/// Resolve the namespace all of this deployment's keys live under.
///
/// Precedence, highest first: the universal `config.namespace` override,
/// the backend-specific `config.<backend>.namespace` override, then the
/// environment-derived formula
/// `environments/<env>/services/<name>/<version>/config` (or
/// `environments/<env>/services/config` when no service name is known).
/// Always returns a non-empty string.
pub fn resolve_namespace(
    deployment: &DeploymentInfo,
    accessor: &dyn ConfigAccessor,
    backend: &str,
) -> String {
    if let Some(ns) = accessor.get(settings::KEY_NAMESPACE) {
        return ns;
    }
    if let Some(ns) = accessor.get(&settings::backend_key(backend, "namespace")) {
        return ns;
    }

    let environment = deployment
        .environment
        .clone()
        .or_else(|| accessor.get("env"))
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
    let service_name = deployment
        .service_name
        .clone()
        .or_else(|| accessor.get("service.name"));

    match service_name {
        Some(name) => {
            let version = deployment
                .service_version
                .clone()
                .or_else(|| accessor.get("service.version"))
                .unwrap_or_else(|| DEFAULT_VERSION.to_string());
            format!("environments/{environment}/services/{name}/{version}/config")
        }
        None => format!("environments/{environment}/services/config"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MapAccessor;

    #[test]
    fn test_universal_override_wins() {
        let accessor = MapAccessor::new()
            .with("config.namespace", "universal/ns")
            .with("config.consul.namespace", "consul/ns")
            .with("env", "prod")
            .with("service.name", "billing");
        let deployment = DeploymentInfo::default();
        assert_eq!(
            resolve_namespace(&deployment, &accessor, "consul"),
            "universal/ns"
        );
    }

    #[test]
    fn test_backend_override_wins_next() {
        let accessor = MapAccessor::new()
            .with("config.consul.namespace", "consul/ns")
            .with("env", "prod");
        let deployment = DeploymentInfo::default();
        assert_eq!(
            resolve_namespace(&deployment, &accessor, "consul"),
            "consul/ns"
        );
        // Another backend's override does not apply.
        assert_eq!(
            resolve_namespace(&deployment, &accessor, "etcd"),
            "environments/prod/services/config"
        );
    }

    #[test]
    fn test_service_formula() {
        let deployment = DeploymentInfo::new("staging").with_service("billing", "2.1.0");
        assert_eq!(
            resolve_namespace(&deployment, &MapAccessor::new(), "consul"),
            "environments/staging/services/billing/2.1.0/config"
        );
    }

    #[test]
    fn test_service_version_defaults() {
        let mut deployment = DeploymentInfo::new("staging");
        deployment.service_name = Some("billing".to_string());
        assert_eq!(
            resolve_namespace(&deployment, &MapAccessor::new(), "consul"),
            "environments/staging/services/billing/1.0.0/config"
        );
    }

    #[test]
    fn test_bare_environment_formula() {
        let deployment = DeploymentInfo::new("prod");
        assert_eq!(
            resolve_namespace(&deployment, &MapAccessor::new(), "consul"),
            "environments/prod/services/config"
        );
    }

    #[test]
    fn test_accessor_fallbacks_and_defaults() {
        let accessor = MapAccessor::new()
            .with("env", "qa")
            .with("service.name", "gateway")
            .with("service.version", "3.0.0");
        assert_eq!(
            resolve_namespace(&DeploymentInfo::default(), &accessor, "etcd"),
            "environments/qa/services/gateway/3.0.0/config"
        );
        // Nothing configured at all: the literal default root.
        assert_eq!(
            resolve_namespace(&DeploymentInfo::default(), &MapAccessor::new(), "etcd"),
            "environments/dev/services/config"
        );
    }
}
