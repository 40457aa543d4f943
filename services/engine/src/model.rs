//! Resource definitions handed to the engine by the configuration layer.

use serde::{Deserialize, Serialize};
use tend_id::{ContainerName, Namespace, ResourceName};

use crate::k8s::LabelSelector;

/// A logical resource the user declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: ResourceName,
    pub deploy: DeployTarget,
}

impl Manifest {
    pub fn k8s(name: impl Into<ResourceName>, target: K8sTarget) -> Self {
        Self {
            name: name.into(),
            deploy: DeployTarget::K8s(target),
        }
    }

    pub fn k8s_target(&self) -> Option<&K8sTarget> {
        match &self.deploy {
            DeployTarget::K8s(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_k8s(&self) -> bool {
        self.k8s_target().is_some()
    }
}

/// Where a resource runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployTarget {
    K8s(K8sTarget),
    DockerCompose { service: String },
    Local { command: String },
}

/// Kubernetes deployment settings of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sTarget {
    /// Namespaces the resource deploys into, known before the first deploy.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,

    #[serde(default)]
    pub port_forwards: Vec<PortForward>,

    /// Additional selectors for pods the resource does not own.
    #[serde(default)]
    pub extra_pod_selectors: Vec<LabelSelector>,

    #[serde(default)]
    pub log_filter: LogFilter,
}

/// A local-to-pod port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForward {
    pub local_port: u16,
    /// Container port; filled in from the pod's declared ports when unset.
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl PortForward {
    pub fn new(local_port: u16, container_port: Option<u16>) -> Self {
        Self {
            local_port,
            container_port,
            host: default_host(),
        }
    }
}

/// Which containers' logs to stream.
///
/// When `only` is non-empty, only listed containers stream. Containers in
/// `ignore` never do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub only: Vec<ContainerName>,
    #[serde(default)]
    pub ignore: Vec<ContainerName>,
}

impl LogFilter {
    pub fn allows(&self, container: &ContainerName) -> bool {
        if !self.only.is_empty() && !self.only.contains(container) {
            return false;
        }
        !self.ignore.contains(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter() {
        let everything = LogFilter::default();
        assert!(everything.allows(&ContainerName::new("app")));

        let only = LogFilter {
            only: vec![ContainerName::new("app")],
            ignore: vec![],
        };
        assert!(only.allows(&ContainerName::new("app")));
        assert!(!only.allows(&ContainerName::new("sidecar")));

        let ignore = LogFilter {
            only: vec![],
            ignore: vec![ContainerName::new("istio-proxy")],
        };
        assert!(!ignore.allows(&ContainerName::new("istio-proxy")));
        assert!(ignore.allows(&ContainerName::new("app")));
    }

    #[test]
    fn test_port_forward_deserialize_defaults() {
        let pf: PortForward = serde_json::from_str(r#"{"local_port": 8080}"#).unwrap();
        assert_eq!(pf, PortForward::new(8080, None));
        assert_eq!(pf.host, "localhost");
    }

    #[test]
    fn test_manifest_kind() {
        let m = Manifest::k8s("web", K8sTarget::default());
        assert!(m.is_k8s());

        let local = Manifest {
            name: ResourceName::new("lint"),
            deploy: DeployTarget::Local {
                command: "make lint".to_string(),
            },
        };
        assert!(local.k8s_target().is_none());
    }
}
