//! Keeps one port-forward session per declared forward of each resource's
//! most recent running pod.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tend_id::{Namespace, PodId, ResourceName, SpanId};
use tend_reconcile::{diff_keyed, Backoff, BackoffPolicy, CancelHandle, CancelSignal};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::resolve::{populate_port_forwards, ResolvedForward};
use crate::clock::Clock;
use crate::error::{ClientError, EngineError};
use crate::k8s::{ClusterClient, PodPhase, PortForwardRequest};
use crate::status::{ForwardState, ForwardStatus, PortForwardStatus, ReportedStatuses, StatusSink};
use crate::store::{Action, EngineState, LogAction, Store, Subscriber};

/// A session that lasted this long counts as a success.
const HEALTHY_SESSION: Duration = Duration::from_secs(1);

/// Identity of the forwards of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardKey {
    pub resource: ResourceName,
    pub pod: PodId,
}

impl ForwardKey {
    pub fn new(resource: impl Into<ResourceName>, pod: impl Into<PodId>) -> Self {
        Self {
            resource: resource.into(),
            pod: pod.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DesiredForwards {
    namespace: Namespace,
    forwards: Vec<ResolvedForward>,
}

fn desired_forwards(state: &EngineState) -> BTreeMap<ForwardKey, DesiredForwards> {
    let mut desired = BTreeMap::new();

    for (mt, runtime) in state.k8s_targets() {
        let Some(target) = mt.manifest.k8s_target() else {
            continue;
        };
        if target.port_forwards.is_empty() {
            continue;
        }

        let Some(pod) = runtime.most_recent_pod() else {
            continue;
        };
        if pod.phase != PodPhase::Running || pod.deleting {
            continue;
        }

        let forwards = populate_port_forwards(&target.port_forwards, pod);
        if forwards.is_empty() {
            continue;
        }

        desired.insert(
            ForwardKey {
                resource: mt.manifest.name.clone(),
                pod: pod.pod_id.clone(),
            },
            DesiredForwards {
                namespace: pod.namespace.clone(),
                forwards,
            },
        );
    }

    desired
}

struct ActiveForward {
    desired: DesiredForwards,
    handle: CancelHandle,
}

#[derive(Default)]
struct ForwardIndex {
    active: BTreeMap<ForwardKey, ActiveForward>,
    statuses: HashMap<ForwardKey, PortForwardStatus>,
    reported: ReportedStatuses<ForwardKey, PortForwardStatus>,
}

impl ForwardIndex {
    fn stop(&mut self, key: &ForwardKey) {
        if let Some(active) = self.active.remove(key) {
            info!(resource = %key.resource, pod = %key.pod, "Stopping port forwards");
            active.handle.cancel();
        }
        self.statuses.remove(key);
        self.reported.forget(key);
    }

    fn pending_report(&mut self, key: &ForwardKey) -> Option<PortForwardStatus> {
        let status = self.statuses.get(key)?;
        if !self.reported.needs_report(key, status) {
            return None;
        }
        let status = status.clone();
        self.reported.mark_reported(key.clone(), status.clone());
        Some(status)
    }
}

struct ForwardShared {
    index: Mutex<ForwardIndex>,
    sink: Arc<dyn StatusSink>,
}

impl ForwardShared {
    async fn set_state(
        &self,
        key: &ForwardKey,
        local_port: u16,
        state: ForwardState,
        started_at: Option<DateTime<Utc>>,
    ) {
        {
            let mut index = self.index.lock().await;
            let forward = index
                .statuses
                .get_mut(key)
                .and_then(|s| s.forwards.iter_mut().find(|f| f.local_port == local_port));
            if let Some(forward) = forward {
                forward.state = state;
                forward.started_at = started_at;
            }
        }
        self.report(key).await;
    }

    async fn report(&self, key: &ForwardKey) {
        let pending = { self.index.lock().await.pending_report(key) };
        let Some(status) = pending else {
            return;
        };

        if let Err(e) = self
            .sink
            .update_port_forward_status(&key.resource, &key.pod, &status)
            .await
        {
            warn!(
                resource = %key.resource,
                pod = %key.pod,
                error = %e,
                "Failed to report port forward status"
            );
            self.index.lock().await.reported.forget(key);
        }
    }
}

/// Retry loop of a single forward.
struct ForwardLoop {
    shared: Arc<ForwardShared>,
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    key: ForwardKey,
    namespace: Namespace,
    forward: ResolvedForward,
    backoff: BackoffPolicy,
    signal: CancelSignal,
}

impl ForwardLoop {
    /// Forward until cancelled. Every other exit is retried.
    async fn run(self) {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = self.signal.cancelled() => return,
                result = self.forward_once() => result,
            };
            if self.signal.is_cancelled() {
                return;
            }

            match result {
                Ok(()) => {
                    debug!(
                        resource = %self.key.resource,
                        local_port = self.forward.local_port,
                        "Port forward closed"
                    );
                    self.set_state(ForwardState::Connecting, None).await;
                }
                Err(e) => self.report_error(&e).await,
            }

            if started.elapsed() < HEALTHY_SESSION {
                let delay = backoff.step();
                tokio::select! {
                    _ = self.signal.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                backoff.reset();
            }
        }
    }

    async fn forward_once(&self) -> Result<(), ClientError> {
        let request = PortForwardRequest {
            namespace: self.namespace.clone(),
            pod: self.key.pod.clone(),
            local_port: self.forward.local_port,
            container_port: self.forward.container_port,
            host: self.forward.host.clone(),
        };

        let mut forwarder = self.client.create_port_forwarder(&request).await?;
        self.set_state(ForwardState::Active, Some(self.clock.now()))
            .await;
        forwarder.forward_ports().await
    }

    async fn report_error(&self, e: &ClientError) {
        info!(
            resource = %self.key.resource,
            pod = %self.key.pod,
            local_port = self.forward.local_port,
            error = %e,
            "Port forward failed, reconnecting"
        );

        // Forwarding errors belong in the pod's log.
        self.store.dispatch(Action::Log(LogAction::info(
            &self.key.resource,
            SpanId::for_pod(&self.key.pod),
            format!(
                "Reconnecting... Error port-forwarding {} ({}:{}): {e}\n",
                self.key.resource, self.forward.local_port, self.forward.container_port
            ),
        )));
        self.set_state(ForwardState::Error(e.to_string()), None)
            .await;
    }

    async fn set_state(&self, state: ForwardState, started_at: Option<DateTime<Utc>>) {
        self.shared
            .set_state(&self.key, self.forward.local_port, state, started_at)
            .await;
    }
}

/// Forwards local ports to the most recent running pod of each resource.
pub struct PortForwardController {
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    signal: CancelSignal,
    backoff: BackoffPolicy,
    shared: Arc<ForwardShared>,
}

impl PortForwardController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        sink: Arc<dyn StatusSink>,
        clock: Arc<dyn Clock>,
        signal: CancelSignal,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            clock,
            signal,
            backoff,
            shared: Arc::new(ForwardShared {
                index: Mutex::new(ForwardIndex::default()),
                sink,
            }),
        }
    }

    /// Pods with forwards running, and their forwards.
    pub async fn active_forwards(&self) -> BTreeMap<ForwardKey, Vec<ResolvedForward>> {
        self.shared
            .index
            .lock()
            .await
            .active
            .iter()
            .map(|(key, active)| (key.clone(), active.desired.forwards.clone()))
            .collect()
    }

    pub async fn status(&self, key: &ForwardKey) -> Option<PortForwardStatus> {
        self.shared.index.lock().await.statuses.get(key).cloned()
    }

    fn start(
        &self,
        index: &mut ForwardIndex,
        store: &Arc<Store>,
        key: &ForwardKey,
        desired: &DesiredForwards,
    ) {
        info!(
            resource = %key.resource,
            pod = %key.pod,
            forwards = desired.forwards.len(),
            "Starting port forwards"
        );

        let status = PortForwardStatus {
            namespace: desired.namespace.clone(),
            forwards: desired
                .forwards
                .iter()
                .map(|f| ForwardStatus {
                    local_port: f.local_port,
                    container_port: f.container_port,
                    host: f.host.clone(),
                    state: ForwardState::Connecting,
                    started_at: None,
                })
                .collect(),
        };
        index.statuses.insert(key.clone(), status);

        let (handle, signal) = self.signal.child();
        for forward in &desired.forwards {
            let task = ForwardLoop {
                shared: Arc::clone(&self.shared),
                client: Arc::clone(&self.client),
                clock: Arc::clone(&self.clock),
                store: Arc::clone(store),
                key: key.clone(),
                namespace: desired.namespace.clone(),
                forward: forward.clone(),
                backoff: self.backoff.clone(),
                signal: signal.clone(),
            };
            tokio::spawn(task.run());
        }

        index.active.insert(
            key.clone(),
            ActiveForward {
                desired: desired.clone(),
                handle,
            },
        );
    }
}

#[async_trait]
impl Subscriber for PortForwardController {
    fn name(&self) -> &str {
        "port-forward"
    }

    async fn on_change(&self, store: &Arc<Store>) -> Result<(), EngineError> {
        let desired = desired_forwards(&*store.read_state().await);

        let started: Vec<ForwardKey> = {
            let mut index = self.shared.index.lock().await;
            let active: BTreeMap<ForwardKey, DesiredForwards> = index
                .active
                .iter()
                .map(|(key, a)| (key.clone(), a.desired.clone()))
                .collect();

            let diff = diff_keyed(&desired, &active);
            if diff.is_empty() {
                return Ok(());
            }

            for key in diff.to_stop.iter().chain(&diff.to_restart) {
                index.stop(key);
            }

            let mut started = Vec::new();
            for key in diff.to_start.into_iter().chain(diff.to_restart) {
                if let Some(want) = desired.get(&key) {
                    self.start(&mut index, store, &key, want);
                    started.push(key);
                }
            }
            started
        };

        for key in &started {
            self.shared.report(key).await;
        }
        Ok(())
    }

    async fn teardown(&self) {
        let mut index = self.shared.index.lock().await;
        let keys: Vec<ForwardKey> = index.active.keys().cloned().collect();
        for key in &keys {
            index.stop(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tend_id::{ContainerName, ObjectUid};
    use tokio::sync::watch;

    use crate::clock::SystemClock;
    use crate::k8s::{
        ContainerSpec, ContainerState, ContainerStatus, FakeClusterClient, FakeForward, Pod,
    };
    use crate::model::{K8sTarget, Manifest, PortForward};
    use crate::status::RecordingStatusSink;
    use crate::store::PodChangeAction;

    struct Harness {
        client: Arc<FakeClusterClient>,
        sink: Arc<RecordingStatusSink>,
        store: Arc<Store>,
        controller: PortForwardController,
        _shutdown: watch::Sender<bool>,
    }

    fn ns() -> Namespace {
        Namespace::new("default")
    }

    fn harness(forwards: Vec<PortForward>) -> Harness {
        let client = Arc::new(FakeClusterClient::new());
        let sink = Arc::new(RecordingStatusSink::new());
        let store = Store::new(EngineState::new(Utc::now(), ns(), 1000));
        store.dispatch(Action::ManifestUpsert(Manifest::k8s(
            "web",
            K8sTarget {
                port_forwards: forwards,
                ..K8sTarget::default()
            },
        )));

        let (tx, rx) = watch::channel(false);
        let controller = PortForwardController::new(
            client.clone(),
            sink.clone(),
            Arc::new(SystemClock),
            CancelSignal::root(rx),
            BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
                jitter: 0.0,
            },
        );

        Harness {
            client,
            sink,
            store,
            controller,
            _shutdown: tx,
        }
    }

    fn pod(name: &str, created: i64, phase: PodPhase) -> Pod {
        Pod::new(name, ns(), ObjectUid::new(format!("uid-{name}")))
            .with_phase(phase)
            .with_created_at(DateTime::from_timestamp(created, 0).unwrap())
            .with_container(
                ContainerSpec {
                    name: ContainerName::new("app"),
                    image: "app:dev".to_string(),
                    ports: vec![80],
                },
                ContainerStatus {
                    name: ContainerName::new("app"),
                    container_id: format!("containerd://{name}-app"),
                    ready: true,
                    state: ContainerState::Running { started_at: None },
                    ..ContainerStatus::default()
                },
            )
    }

    async fn track(h: &Harness, pod: Pod) {
        h.store.dispatch(Action::PodChange(PodChangeAction::new(
            pod,
            ResourceName::new("web"),
            None,
        )));
        h.store.apply_pending().await;
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_forward_started_for_running_pod() {
        let h = harness(vec![PortForward::new(8080, None)]);
        h.client.set_forward(FakeForward::Hold);
        track(&h, pod("web-1", 100, PodPhase::Running)).await;

        h.controller.on_change(&h.store).await.unwrap();
        wait_until(|| h.client.forward_calls().len() == 1).await;

        let request = &h.client.forward_calls()[0];
        assert_eq!(request.pod, PodId::new("web-1"));
        assert_eq!(request.local_port, 8080);
        assert_eq!(request.container_port, 80);
        assert_eq!(request.host, "localhost");

        wait_until(|| {
            h.sink
                .latest_forward_status(&ResourceName::new("web"), &PodId::new("web-1"))
                .is_some_and(|s| s.forwards[0].state == ForwardState::Active)
        })
        .await;
    }

    #[tokio::test]
    async fn test_diff_is_idempotent() {
        let h = harness(vec![PortForward::new(8080, Some(80))]);
        h.client.set_forward(FakeForward::Hold);
        track(&h, pod("web-1", 100, PodPhase::Running)).await;

        h.controller.on_change(&h.store).await.unwrap();
        h.controller.on_change(&h.store).await.unwrap();
        wait_until(|| !h.client.forward_calls().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.client.forward_calls().len(), 1);
        assert_eq!(h.controller.active_forwards().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_pod_not_forwarded() {
        let h = harness(vec![PortForward::new(8080, None)]);
        track(&h, pod("web-1", 100, PodPhase::Pending)).await;

        h.controller.on_change(&h.store).await.unwrap();

        assert!(h.controller.active_forwards().await.is_empty());
        assert!(h.client.forward_calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_forwards_declared() {
        let h = harness(vec![]);
        track(&h, pod("web-1", 100, PodPhase::Running)).await;

        h.controller.on_change(&h.store).await.unwrap();
        assert!(h.controller.active_forwards().await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_retried_and_logged() {
        let h = harness(vec![PortForward::new(8080, None)]);
        h.client.set_forward(FakeForward::Fail("connection refused".to_string()));
        track(&h, pod("web-1", 100, PodPhase::Running)).await;

        h.controller.on_change(&h.store).await.unwrap();
        wait_until(|| h.client.forward_calls().len() >= 3).await;

        h.store.apply_pending().await;
        let text = h
            .store
            .read_state()
            .await
            .log_store
            .text_for_span(&SpanId::for_pod(&PodId::new("web-1")));
        let expected = "Reconnecting... Error port-forwarding web (8080:80): \
                        transient error: connection refused\n";
        assert!(text.contains(expected));

        let status = h.controller.status(&ForwardKey::new("web", "web-1")).await.unwrap();
        assert!(matches!(status.forwards[0].state, ForwardState::Error(_) | ForwardState::Active));
    }

    #[tokio::test]
    async fn test_new_pod_replaces_forward() {
        let h = harness(vec![PortForward::new(8080, None)]);
        h.client.set_forward(FakeForward::Hold);
        track(&h, pod("web-1", 100, PodPhase::Running)).await;
        h.controller.on_change(&h.store).await.unwrap();

        // A second pod for the same resource, created later.
        track(&h, pod("web-2", 200, PodPhase::Running)).await;
        h.controller.on_change(&h.store).await.unwrap();

        let active = h.controller.active_forwards().await;
        assert_eq!(
            active.keys().cloned().collect::<Vec<_>>(),
            vec![ForwardKey::new("web", "web-2")]
        );
        assert!(h.controller.status(&ForwardKey::new("web", "web-1")).await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_stops_everything() {
        let h = harness(vec![PortForward::new(8080, None)]);
        h.client.set_forward(FakeForward::Hold);
        track(&h, pod("web-1", 100, PodPhase::Running)).await;
        h.controller.on_change(&h.store).await.unwrap();

        h.controller.teardown().await;
        assert!(h.controller.active_forwards().await.is_empty());
    }
}
