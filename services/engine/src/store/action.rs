//! Actions: the only way state changes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tend_id::{ContainerId, Namespace, ObjectUid, PodId, ResourceName, SpanId};

use super::log_store::{LogEntry, LogLevel};
use super::state::DeployedRef;
use crate::k8s::{K8sEvent, Pod};
use crate::model::Manifest;

/// A state change request, applied in dispatch order.
#[derive(Debug, Clone)]
pub enum Action {
    /// A resource was declared or redefined.
    ManifestUpsert(Manifest),
    /// A resource was removed from the configuration.
    ManifestRemove(ResourceName),
    K8sDeployed(K8sDeployedAction),
    LiveUpdated(LiveUpdateAction),
    PodChange(PodChangeAction),
    PodDelete(PodDeleteAction),
    PodResetRestarts(PodResetRestartsAction),
    K8sEvent(K8sEventAction),
    Log(LogAction),
    Error(ErrorAction),
}

impl Action {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Action::ManifestUpsert(_) => "ManifestUpsert",
            Action::ManifestRemove(_) => "ManifestRemove",
            Action::K8sDeployed(_) => "K8sDeployed",
            Action::LiveUpdated(_) => "LiveUpdated",
            Action::PodChange(_) => "PodChange",
            Action::PodDelete(_) => "PodDelete",
            Action::PodResetRestarts(_) => "PodResetRestarts",
            Action::K8sEvent(_) => "K8sEvent",
            Action::Log(_) => "Log",
            Action::Error(_) => "Error",
        }
    }
}

/// A deploy finished and created or updated these objects.
#[derive(Debug, Clone)]
pub struct K8sDeployedAction {
    pub resource: ResourceName,
    pub refs: Vec<DeployedRef>,
    pub pod_template_hashes: BTreeSet<String>,
    pub at: DateTime<Utc>,
}

/// Files were synced into running containers.
#[derive(Debug, Clone)]
pub struct LiveUpdateAction {
    pub resource: ResourceName,
    pub container_ids: BTreeSet<ContainerId>,
    pub span_id: SpanId,
}

/// A pod attributed to a resource changed.
#[derive(Debug, Clone)]
pub struct PodChangeAction {
    pub pod: Pod,
    pub resource: ResourceName,
    /// Deployed object the pod descends from; `None` for selector matches.
    pub matched_ancestor: Option<ObjectUid>,
    pub observed_at: DateTime<Utc>,
}

impl PodChangeAction {
    pub fn new(pod: Pod, resource: ResourceName, matched_ancestor: Option<ObjectUid>) -> Self {
        Self {
            pod,
            resource,
            matched_ancestor,
            observed_at: Utc::now(),
        }
    }
}

/// A pod was deleted from the cluster.
#[derive(Debug, Clone)]
pub struct PodDeleteAction {
    pub pod_id: PodId,
    pub namespace: Namespace,
}

/// The user acknowledged a pod's restarts.
#[derive(Debug, Clone)]
pub struct PodResetRestartsAction {
    pub resource: ResourceName,
    pub pod_id: PodId,
    /// Restart count the user saw when acknowledging.
    pub visible_restarts: u32,
}

/// A Kubernetes event attributed to a resource.
#[derive(Debug, Clone)]
pub struct K8sEventAction {
    pub event: K8sEvent,
    pub resource: ResourceName,
}

/// Output for the user-facing log.
#[derive(Debug, Clone)]
pub struct LogAction {
    pub resource: Option<ResourceName>,
    pub span_id: SpanId,
    pub level: LogLevel,
    pub text: String,
    pub time: DateTime<Utc>,
}

impl LogAction {
    pub fn new(
        resource: Option<ResourceName>,
        span_id: SpanId,
        level: LogLevel,
        text: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            span_id,
            level,
            text: text.into(),
            time: Utc::now(),
        }
    }

    pub fn info(resource: &ResourceName, span_id: SpanId, text: impl Into<String>) -> Self {
        Self::new(Some(resource.clone()), span_id, LogLevel::Info, text)
    }

    pub fn warn(resource: &ResourceName, span_id: SpanId, text: impl Into<String>) -> Self {
        Self::new(Some(resource.clone()), span_id, LogLevel::Warn, text)
    }

    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            time: self.time,
            resource: self.resource,
            span_id: self.span_id,
            level: self.level,
            text: self.text,
        }
    }
}

/// A failure the user should see.
#[derive(Debug, Clone)]
pub struct ErrorAction {
    pub message: String,
}

impl ErrorAction {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
