//! The engine's authoritative state.
//!
//! Everything here is mutated only by the reducers, under the store's write
//! lock. Watchers and controllers read it through
//! [`Store::read_state`](super::Store::read_state).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tend_id::{ContainerId, ContainerName, Namespace, ObjectUid, PodId, ResourceName, SpanId};

use super::log_store::LogStore;
use crate::k8s::{Pod, PodPhase};
use crate::model::{DeployTarget, Manifest};

/// Label carrying the pod template hash the engine deployed.
pub const POD_TEMPLATE_HASH_LABEL: &str = "tend.dev/pod-template-hash";

/// Maximum number of error messages retained.
const MAX_ERRORS: usize = 100;

/// Root state object.
#[derive(Debug)]
pub struct EngineState {
    /// When the engine started. Earlier events are ignored.
    pub start_time: DateTime<Utc>,

    /// Namespace for deployed objects that carry none.
    pub default_namespace: Namespace,

    pub manifest_targets: BTreeMap<ResourceName, ManifestTarget>,

    pub log_store: LogStore,

    /// Recent user-facing errors, oldest first.
    pub errors: Vec<String>,
}

impl EngineState {
    pub fn new(
        start_time: DateTime<Utc>,
        default_namespace: Namespace,
        max_log_entries: usize,
    ) -> Self {
        Self {
            start_time,
            default_namespace,
            manifest_targets: BTreeMap::new(),
            log_store: LogStore::new(max_log_entries),
            errors: Vec::new(),
        }
    }

    pub fn manifest_target(&self, name: &ResourceName) -> Option<&ManifestTarget> {
        self.manifest_targets.get(name)
    }

    pub fn manifest_target_mut(&mut self, name: &ResourceName) -> Option<&mut ManifestTarget> {
        self.manifest_targets.get_mut(name)
    }

    /// Kubernetes manifests and their runtime state.
    pub fn k8s_targets(&self) -> impl Iterator<Item = (&ManifestTarget, &K8sRuntimeState)> {
        self.manifest_targets
            .values()
            .filter_map(|mt| mt.state.k8s_runtime().map(|runtime| (mt, runtime)))
    }

    /// Add or replace a manifest. Runtime state survives as long as the
    /// deploy target kind does not change.
    pub fn upsert_manifest(&mut self, manifest: Manifest) {
        match self.manifest_targets.get_mut(&manifest.name) {
            Some(mt) if mt.state.runtime.matches_target(&manifest.deploy) => {
                mt.manifest = manifest;
            }
            _ => {
                let name = manifest.name.clone();
                self.manifest_targets
                    .insert(name, ManifestTarget::new(manifest));
            }
        }
    }

    pub fn remove_manifest(&mut self, name: &ResourceName) -> Option<ManifestTarget> {
        self.manifest_targets.remove(name)
    }

    pub fn record_error(&mut self, message: String) {
        if self.errors.len() >= MAX_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(message);
    }
}

/// A manifest together with what the engine knows about it at runtime.
#[derive(Debug, Clone)]
pub struct ManifestTarget {
    pub manifest: Manifest,
    pub state: ManifestState,
}

impl ManifestTarget {
    pub fn new(manifest: Manifest) -> Self {
        let state = ManifestState::new(manifest.name.clone(), &manifest.deploy);
        Self { manifest, state }
    }
}

/// Per-resource runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct ManifestState {
    pub name: ResourceName,
    pub runtime: RuntimeState,

    /// Containers that received in-place updates since the last full deploy.
    pub live_updated_container_ids: BTreeSet<ContainerId>,

    /// Set once a live-updated container disappeared; a full rebuild is due.
    pub needs_rebuild_from_crash: bool,

    /// Span of the most recent build, if any.
    pub last_build_span: Option<SpanId>,
}

impl ManifestState {
    pub fn new(name: ResourceName, target: &DeployTarget) -> Self {
        Self {
            name,
            runtime: RuntimeState::for_target(target),
            live_updated_container_ids: BTreeSet::new(),
            needs_rebuild_from_crash: false,
            last_build_span: None,
        }
    }

    pub fn k8s_runtime(&self) -> Option<&K8sRuntimeState> {
        match &self.runtime {
            RuntimeState::K8s(runtime) => Some(runtime),
            _ => None,
        }
    }

    pub fn k8s_runtime_mut(&mut self) -> Option<&mut K8sRuntimeState> {
        match &mut self.runtime {
            RuntimeState::K8s(runtime) => Some(runtime),
            _ => None,
        }
    }

    /// Span used for build-level notices about this resource.
    pub fn build_span(&self) -> SpanId {
        self.last_build_span
            .clone()
            .unwrap_or_else(|| SpanId::for_build(&self.name))
    }
}

/// Runtime state, by deploy target kind.
#[derive(Debug, Clone)]
pub enum RuntimeState {
    K8s(K8sRuntimeState),
    DockerCompose(DockerComposeRuntimeState),
    Local(LocalRuntimeState),
}

impl RuntimeState {
    pub fn for_target(target: &DeployTarget) -> Self {
        match target {
            DeployTarget::K8s(_) => RuntimeState::K8s(K8sRuntimeState::default()),
            DeployTarget::DockerCompose { .. } => {
                RuntimeState::DockerCompose(DockerComposeRuntimeState::default())
            }
            DeployTarget::Local { .. } => RuntimeState::Local(LocalRuntimeState::default()),
        }
    }

    fn matches_target(&self, target: &DeployTarget) -> bool {
        matches!(
            (self, target),
            (RuntimeState::K8s(_), DeployTarget::K8s(_))
                | (RuntimeState::DockerCompose(_), DeployTarget::DockerCompose { .. })
                | (RuntimeState::Local(_), DeployTarget::Local { .. })
        )
    }

    /// IDs of every container currently running for the resource.
    pub fn running_container_ids(&self) -> BTreeSet<ContainerId> {
        match self {
            RuntimeState::K8s(runtime) => runtime
                .pods
                .values()
                .flat_map(|pod| pod.containers.iter())
                .filter(|c| c.running && !c.id.is_empty())
                .map(|c| c.id.clone())
                .collect(),
            RuntimeState::DockerCompose(dc) => dc
                .container_id
                .iter()
                .filter(|_| dc.running)
                .cloned()
                .collect(),
            RuntimeState::Local(_) => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerComposeRuntimeState {
    pub container_id: Option<ContainerId>,
    pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LocalRuntimeState {
    pub pid: Option<u32>,
}

/// What the tracked pods of a resource descend from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PodAncestor {
    /// No pod tracked yet.
    #[default]
    Unknown,
    /// Pods matched through an extra label selector.
    Selector,
    /// Pods owned by this deployed object.
    Owner(ObjectUid),
}

/// An object the last deploy created or updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedRef {
    pub kind: String,
    pub name: String,
    /// Empty when the object was deployed without an explicit namespace.
    pub namespace: Namespace,
    pub uid: ObjectUid,
}

/// Kubernetes runtime state of a resource.
#[derive(Debug, Clone, Default)]
pub struct K8sRuntimeState {
    pub pods: BTreeMap<PodId, TrackedPod>,
    pub pod_ancestor: PodAncestor,
    pub deployed_refs: Vec<DeployedRef>,

    /// Template hashes of the current deploy. Empty accepts every pod.
    pub pod_template_hashes: BTreeSet<String>,

    pub last_deploy_time: Option<DateTime<Utc>>,
    pub last_ready_or_succeeded_time: Option<DateTime<Utc>>,
}

impl K8sRuntimeState {
    pub fn has_deployed_uid(&self, uid: &ObjectUid) -> bool {
        self.deployed_refs.iter().any(|r| &r.uid == uid)
    }

    /// Whether a pod was created from the current deploy's templates.
    pub fn has_ok_pod_template_hash(&self, pod: &Pod) -> bool {
        if self.pod_template_hashes.is_empty() {
            return true;
        }

        pod.label(POD_TEMPLATE_HASH_LABEL)
            .is_some_and(|hash| self.pod_template_hashes.contains(hash))
    }

    /// The pod worth showing: the newest one still running, falling back to
    /// the newest overall.
    pub fn most_recent_pod(&self) -> Option<&TrackedPod> {
        let newest = |a: &&TrackedPod, b: &&TrackedPod| {
            (a.created_at, &a.pod_id).cmp(&(b.created_at, &b.pod_id))
        };

        self.pods
            .values()
            .filter(|p| !p.is_terminated())
            .max_by(newest)
            .or_else(|| self.pods.values().max_by(newest))
    }
}

/// A container as tracked in state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub name: ContainerName,
    pub id: ContainerId,
    pub image: String,
    pub ports: Vec<u16>,
    pub ready: bool,
    pub running: bool,
    pub terminated: bool,
    pub restarts: u32,
    /// When the container last stopped, if it did.
    pub terminated_at: Option<DateTime<Utc>>,
}

/// A pod attributed to a resource.
#[derive(Debug, Clone)]
pub struct TrackedPod {
    pub pod_id: PodId,
    pub namespace: Namespace,
    pub uid: ObjectUid,
    pub created_at: DateTime<Utc>,
    pub phase: PodPhase,
    pub deleting: bool,

    /// One-word summary, as in `kubectl get pods`.
    pub status: String,
    pub status_messages: Vec<String>,

    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,

    /// Restarts already acknowledged; subtracted from the visible count.
    pub baseline_restarts: u32,

    pub span_id: SpanId,
}

impl TrackedPod {
    pub fn new(pod: &Pod) -> Self {
        let pod_id = pod.pod_id();
        Self {
            span_id: SpanId::for_pod(&pod_id),
            pod_id,
            namespace: pod.meta.namespace.clone(),
            uid: pod.meta.uid.clone(),
            created_at: pod.meta.creation_timestamp,
            phase: pod.phase,
            deleting: pod.is_deleting(),
            status: String::new(),
            status_messages: Vec::new(),
            init_containers: Vec::new(),
            containers: Vec::new(),
            baseline_restarts: 0,
        }
    }

    pub fn all_container_restarts(&self) -> u32 {
        self.containers.iter().map(|c| c.restarts).sum()
    }

    /// Restarts the user has not acknowledged yet.
    pub fn visible_container_restarts(&self) -> u32 {
        self.all_container_restarts()
            .saturating_sub(self.baseline_restarts)
    }

    pub fn all_containers_ready(&self) -> bool {
        !self.containers.is_empty() && self.containers.iter().all(|c| c.ready)
    }

    pub fn all_container_ports(&self) -> Vec<u16> {
        self.containers
            .iter()
            .flat_map(|c| c.ports.iter().copied())
            .collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::K8sTarget;

    fn tracked(name: &str, created: i64, phase: PodPhase) -> TrackedPod {
        let pod = Pod::new(name, Namespace::new("default"), ObjectUid::new(name))
            .with_phase(phase)
            .with_created_at(DateTime::from_timestamp(created, 0).unwrap());
        TrackedPod::new(&pod)
    }

    fn container(restarts: u32, ready: bool) -> Container {
        Container {
            restarts,
            ready,
            ..Container::default()
        }
    }

    #[test]
    fn test_visible_restarts() {
        let mut pod = tracked("web-1", 100, PodPhase::Running);
        pod.containers = vec![container(2, true), container(3, true)];
        pod.baseline_restarts = 4;

        assert_eq!(pod.all_container_restarts(), 5);
        assert_eq!(pod.visible_container_restarts(), 1);
        assert!(pod.all_containers_ready());

        pod.baseline_restarts = 9;
        assert_eq!(pod.visible_container_restarts(), 0);
    }

    #[test]
    fn test_most_recent_pod_prefers_running() {
        let mut runtime = K8sRuntimeState::default();
        for pod in [
            tracked("old-running", 100, PodPhase::Running),
            tracked("new-failed", 300, PodPhase::Failed),
        ] {
            runtime.pods.insert(pod.pod_id.clone(), pod);
        }

        let best = runtime.most_recent_pod().unwrap();
        assert_eq!(best.pod_id.as_str(), "old-running");
    }

    #[test]
    fn test_most_recent_pod_all_terminated() {
        let mut runtime = K8sRuntimeState::default();
        for pod in [
            tracked("a", 100, PodPhase::Failed),
            tracked("b", 200, PodPhase::Succeeded),
        ] {
            runtime.pods.insert(pod.pod_id.clone(), pod);
        }

        assert_eq!(runtime.most_recent_pod().unwrap().pod_id.as_str(), "b");
    }

    #[test]
    fn test_pod_template_hash() {
        let mut runtime = K8sRuntimeState::default();
        let pod = Pod::new("web-1", Namespace::new("default"), ObjectUid::new("u1"))
            .with_label(POD_TEMPLATE_HASH_LABEL, "abc");

        assert!(runtime.has_ok_pod_template_hash(&pod));

        runtime.pod_template_hashes.insert("def".to_string());
        assert!(!runtime.has_ok_pod_template_hash(&pod));

        runtime.pod_template_hashes.insert("abc".to_string());
        assert!(runtime.has_ok_pod_template_hash(&pod));
    }

    #[test]
    fn test_upsert_manifest_keeps_runtime() {
        let mut state = EngineState::new(Utc::now(), Namespace::new("default"), 100);
        let name = ResourceName::new("web");
        state.upsert_manifest(Manifest::k8s(name.clone(), K8sTarget::default()));

        let pod = tracked("web-1", 100, PodPhase::Running);
        state
            .manifest_target_mut(&name)
            .and_then(|mt| mt.state.k8s_runtime_mut())
            .unwrap()
            .pods
            .insert(pod.pod_id.clone(), pod);

        state.upsert_manifest(Manifest::k8s(name.clone(), K8sTarget::default()));
        assert_eq!(
            state.manifest_target(&name).unwrap().state.k8s_runtime().unwrap().pods.len(),
            1
        );

        state.upsert_manifest(Manifest {
            name: name.clone(),
            deploy: DeployTarget::Local {
                command: "./run".to_string(),
            },
        });
        assert!(state.manifest_target(&name).unwrap().state.k8s_runtime().is_none());
    }
}
