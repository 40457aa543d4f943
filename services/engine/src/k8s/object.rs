//! Cluster object snapshots as the engine sees them.
//!
//! These are deliberately smaller than the real API objects: only the fields
//! the engine reads are modelled.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tend_id::{ContainerId, ContainerName, Namespace, ObjectUid, PodId};

/// Metadata shared by every cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub uid: ObjectUid,
    pub name: String,
    pub namespace: Namespace,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Direct owners, nearest first.
    #[serde(default)]
    pub owner_references: Vec<ObjectRef>,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// A reference to another cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: Namespace,
    pub uid: ObjectUid,
}

impl ObjectRef {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Namespace,
        uid: ObjectUid,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace,
            uid,
        }
    }
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Returns true if no container in the pod will run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Declared container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Details of a terminated container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatedState {
    pub exit_code: i32,
    #[serde(default)]
    pub signal: i32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Current state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Waiting { reason: String, message: String },
    Running { started_at: Option<DateTime<Utc>> },
    Terminated(TerminatedState),
}

impl Default for ContainerState {
    fn default() -> Self {
        ContainerState::Waiting {
            reason: String::new(),
            message: String::new(),
        }
    }
}

/// Observed container status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: ContainerName,
    /// Runtime-qualified id, e.g. `containerd://abc123`. Empty until the
    /// container is created.
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub last_termination: Option<TerminatedState>,
}

impl ContainerStatus {
    /// Container id with any runtime scheme prefix stripped.
    pub fn id(&self) -> ContainerId {
        let raw = self
            .container_id
            .split_once("://")
            .map_or(self.container_id.as_str(), |(_, id)| id);
        ContainerId::new(raw)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ContainerState::Running { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, ContainerState::Terminated(_))
    }
}

/// A pod snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub phase: PodPhase,
    /// Pod-level reason, e.g. `Evicted`.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl Pod {
    /// Create an empty pending pod.
    pub fn new(name: impl Into<String>, namespace: Namespace, uid: ObjectUid) -> Self {
        Self {
            meta: ObjectMeta {
                uid,
                name: name.into(),
                namespace,
                ..ObjectMeta::default()
            },
            ..Self::default()
        }
    }

    pub fn pod_id(&self) -> PodId {
        PodId::new(self.meta.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta.labels.get(key).map(String::as_str)
    }

    /// Reference to this pod, used as the root of its owner tree.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            "Pod",
            self.meta.name.clone(),
            self.meta.namespace.clone(),
            self.meta.uid.clone(),
        )
    }

    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: ObjectRef) -> Self {
        self.meta.owner_references.push(owner);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.meta.creation_timestamp = at;
        self
    }

    /// Add a container and its status.
    pub fn with_container(mut self, spec: ContainerSpec, status: ContainerStatus) -> Self {
        self.containers.push(spec);
        self.container_statuses.push(status);
        self
    }

    /// Add an init container and its status.
    pub fn with_init_container(mut self, spec: ContainerSpec, status: ContainerStatus) -> Self {
        self.init_containers.push(spec);
        self.init_container_statuses.push(status);
        self
    }
}

/// One item of a pod watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodUpdate {
    /// The pod was added or modified.
    Upsert(Pod),
    /// The pod was deleted.
    Deleted { namespace: Namespace, name: PodId },
}

/// Severity of a Kubernetes event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

/// A Kubernetes event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sEvent {
    pub meta: ObjectMeta,
    pub involved_object: ObjectRef,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub event_type: EventType,
}

impl K8sEvent {
    pub fn new(
        meta: ObjectMeta,
        involved_object: ObjectRef,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            meta,
            involved_object,
            reason: reason.into(),
            message: message.into(),
            event_type,
        }
    }

    /// Returns true if the event is worth showing to the user.
    ///
    /// Every non-normal event qualifies. Normal events only do for image
    /// pulls, which are the slow part of most pod startups.
    pub fn should_log(&self) -> bool {
        if self.event_type != EventType::Normal {
            return true;
        }
        matches!(self.reason.as_str(), "Pulling" | "Pulled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, reason: &str) -> K8sEvent {
        K8sEvent::new(
            ObjectMeta::default(),
            ObjectRef::default(),
            event_type,
            reason,
            "msg",
        )
    }

    #[test]
    fn test_should_log_event() {
        assert!(event(EventType::Warning, "BackOff").should_log());
        assert!(event(EventType::Normal, "Pulling").should_log());
        assert!(event(EventType::Normal, "Pulled").should_log());
        assert!(!event(EventType::Normal, "Scheduled").should_log());
        assert!(!event(EventType::Normal, "Started").should_log());
    }

    #[test]
    fn test_container_id_strips_scheme() {
        let status = ContainerStatus {
            container_id: "containerd://abc123".to_string(),
            ..ContainerStatus::default()
        };
        assert_eq!(status.id().as_str(), "abc123");

        let bare = ContainerStatus {
            container_id: "abc123".to_string(),
            ..ContainerStatus::default()
        };
        assert_eq!(bare.id().as_str(), "abc123");
    }

    #[test]
    fn test_pod_builders() {
        let pod = Pod::new("web-1", Namespace::new("default"), ObjectUid::new("u1"))
            .with_phase(PodPhase::Running)
            .with_label("app", "web");

        assert_eq!(pod.pod_id().as_str(), "web-1");
        assert_eq!(pod.label("app"), Some("web"));
        assert!(!pod.is_deleting());
        assert_eq!(pod.object_ref().kind, "Pod");
    }

    #[test]
    fn test_terminal_phases() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
    }
}
