//! Reconciles container log streams against tracked pods.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tend_id::{ContainerId, ContainerName, Namespace, PodId, ResourceName, SpanId};
use tend_reconcile::{CancelHandle, CancelSignal};
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::lines::LineBuffer;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::k8s::{ClusterClient, LogReader};
use crate::model::LogFilter;
use crate::status::{ContainerLogStreamStatus, PodLogStreamStatus, ReportedStatuses, StatusSink};
use crate::store::{Action, Container, EngineState, LogAction, Store, Subscriber};

const MIN_HEALTH_CHECK: Duration = Duration::from_millis(10);

/// Identity of one pod's log stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamName {
    pub resource: ResourceName,
    pub pod: PodId,
}

impl StreamName {
    pub fn new(resource: impl Into<ResourceName>, pod: impl Into<PodId>) -> Self {
        Self {
            resource: resource.into(),
            pod: pod.into(),
        }
    }
}

/// What should be streamed for one pod.
#[derive(Debug, Clone)]
struct PodLogStreamSpec {
    name: StreamName,
    namespace: Namespace,
    since: DateTime<Utc>,
    filter: LogFilter,
    init_containers: Vec<Container>,
    containers: Vec<Container>,
}

fn desired_streams(state: &EngineState) -> BTreeMap<StreamName, PodLogStreamSpec> {
    let mut desired = BTreeMap::new();

    for (mt, runtime) in state.k8s_targets() {
        let filter = mt
            .manifest
            .k8s_target()
            .map(|t| t.log_filter.clone())
            .unwrap_or_default();

        for pod in runtime.pods.values().filter(|p| !p.deleting) {
            let name = StreamName {
                resource: mt.manifest.name.clone(),
                pod: pod.pod_id.clone(),
            };
            desired.insert(
                name.clone(),
                PodLogStreamSpec {
                    name,
                    namespace: pod.namespace.clone(),
                    // Output from before the engine started is history.
                    since: state.start_time,
                    filter: filter.clone(),
                    init_containers: pod.init_containers.clone(),
                    containers: pod.containers.clone(),
                },
            );
        }
    }

    desired
}

/// How a container stream task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    /// End of stream or cancellation.
    Ended { at: DateTime<Utc> },
    /// The log could not be opened or a read failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PodLogKey {
    stream: StreamName,
    container: ContainerId,
}

struct PodLogWatch {
    container: ContainerName,
    handle: CancelHandle,
    exit: watch::Receiver<Option<StreamExit>>,
}

impl PodLogWatch {
    fn exit(&self) -> Option<StreamExit> {
        *self.exit.borrow()
    }
}

#[derive(Default)]
struct LogStreamIndex {
    watches: HashMap<PodLogKey, PodLogWatch>,
    /// Streams that already read a container to the end.
    has_closed_stream: HashSet<PodLogKey>,
    statuses: HashMap<StreamName, PodLogStreamStatus>,
    reported: ReportedStatuses<StreamName, PodLogStreamStatus>,
}

impl LogStreamIndex {
    fn should_stream(&self, container: &Container, key: &PodLogKey) -> bool {
        if container.id.is_empty() {
            return false;
        }
        if container.terminated && self.has_closed_stream.contains(key) {
            return false;
        }
        container.running || container.terminated
    }

    /// Reset the stream's status if the streamed containers changed.
    fn ensure_status(&mut self, name: &StreamName, containers: &[&Container]) {
        let unchanged = self.statuses.get(name).is_some_and(|status| {
            status
                .containers
                .iter()
                .map(|c| &c.name)
                .eq(containers.iter().map(|c| &c.name))
        });
        if unchanged {
            return;
        }

        let status = PodLogStreamStatus {
            containers: containers
                .iter()
                .map(|c| ContainerLogStreamStatus {
                    name: c.name.clone(),
                    ..ContainerLogStreamStatus::default()
                })
                .collect(),
        };
        self.statuses.insert(name.clone(), status);
    }

    fn update_status(
        &mut self,
        name: &StreamName,
        container: &ContainerName,
        update: impl FnOnce(&mut ContainerLogStreamStatus),
    ) {
        let status = self
            .statuses
            .get_mut(name)
            .and_then(|s| s.containers.iter_mut().find(|c| &c.name == container));
        if let Some(status) = status {
            update(status);
        }
    }

    /// The stream's status if it changed since last reported, marking it
    /// reported.
    fn pending_report(&mut self, name: &StreamName) -> Option<PodLogStreamStatus> {
        let status = self.statuses.get(name)?;
        if !self.reported.needs_report(name, status) {
            return None;
        }
        let status = status.clone();
        self.reported.mark_reported(name.clone(), status.clone());
        Some(status)
    }

    fn stream_names(&self) -> HashSet<StreamName> {
        self.watches
            .keys()
            .map(|key| key.stream.clone())
            .chain(self.statuses.keys().cloned())
            .collect()
    }

    fn delete_stream(&mut self, name: &StreamName) {
        self.watches.retain(|key, watch| {
            if &key.stream == name {
                watch.handle.cancel();
                false
            } else {
                true
            }
        });
        self.has_closed_stream.retain(|key| &key.stream != name);
        self.statuses.remove(name);
        self.reported.forget(name);
    }
}

/// State shared between the controller and its stream tasks.
struct LogStreamShared {
    index: Mutex<LogStreamIndex>,
    sink: Arc<dyn StatusSink>,
}

impl LogStreamShared {
    /// Apply a status update from a stream task. Once the controller has
    /// cancelled the task, it owns the status and the update is dropped.
    async fn update_status(
        &self,
        signal: &CancelSignal,
        name: &StreamName,
        container: &ContainerName,
        update: impl FnOnce(&mut ContainerLogStreamStatus),
    ) {
        {
            let mut index = self.index.lock().await;
            if signal.is_cancelled() {
                return;
            }
            index.update_status(name, container, update);
        }
        self.report(name).await;
    }

    async fn report(&self, name: &StreamName) {
        let pending = { self.index.lock().await.pending_report(name) };
        let Some(status) = pending else {
            return;
        };

        if let Err(e) = self
            .sink
            .update_log_stream_status(&name.resource, &name.pod, &status)
            .await
        {
            warn!(
                resource = %name.resource,
                pod = %name.pod,
                error = %e,
                "Failed to report log stream status"
            );
            self.index.lock().await.reported.forget(name);
        }
    }
}

enum ReadOutcome {
    Eof,
    Cancelled,
    Stale { last_read: DateTime<Utc> },
    Failed(String),
}

/// Task following one container's log.
struct ContainerLogStream {
    shared: Arc<LogStreamShared>,
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    name: StreamName,
    namespace: Namespace,
    container: ContainerName,
    since: DateTime<Utc>,
    prefix: Option<String>,
    health_check: Duration,
    reconnect_gap: Duration,
    signal: CancelSignal,
}

impl ContainerLogStream {
    async fn run(self, exit: watch::Sender<Option<StreamExit>>) {
        let outcome = self.consume().await;
        let _ = exit.send(Some(outcome));
    }

    async fn consume(&self) -> StreamExit {
        let mut since = self.since;

        loop {
            let opened = tokio::select! {
                _ = self.signal.cancelled() => return self.ended(),
                opened = self.client.container_logs(
                    &self.name.pod,
                    &self.container,
                    &self.namespace,
                    Some(since),
                ) => opened,
            };

            let reader = match opened {
                Ok(reader) => reader,
                Err(e) => {
                    self.fail(e.to_string()).await;
                    return StreamExit::Failed;
                }
            };

            self.shared
                .update_status(&self.signal, &self.name, &self.container, |s| {
                    s.active = true;
                    s.error = None;
                })
                .await;

            match self.read(reader).await {
                ReadOutcome::Eof => {
                    debug!(pod = %self.name.pod, container = %self.container, "Log stream ended");
                    self.shared
                        .update_status(&self.signal, &self.name, &self.container, |s| {
                            s.active = false
                        })
                        .await;
                    return self.ended();
                }
                ReadOutcome::Cancelled => return self.ended(),
                ReadOutcome::Stale { last_read } => {
                    info!(
                        pod = %self.name.pod,
                        container = %self.container,
                        "Log stream went quiet, reconnecting"
                    );
                    let gap = chrono::Duration::from_std(self.reconnect_gap)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    since = last_read + gap;
                }
                ReadOutcome::Failed(message) => {
                    self.fail(message).await;
                    return StreamExit::Failed;
                }
            }
        }
    }

    async fn read(&self, mut reader: LogReader) -> ReadOutcome {
        let mut lines = LineBuffer::new(self.prefix.clone());
        let mut buf = vec![0u8; 8 * 1024];
        let mut last_read: Option<DateTime<Utc>> = None;

        let period = self.health_check.max(MIN_HEALTH_CHECK);
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = self.signal.cancelled() => break ReadOutcome::Cancelled,
                _ = health.tick() => {
                    // A stream that never produced anything is not stale.
                    if let Some(last) = last_read {
                        if self.is_stale(last) {
                            break ReadOutcome::Stale { last_read: last };
                        }
                    }
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break ReadOutcome::Eof,
                    Ok(n) => {
                        last_read = Some(self.clock.now());
                        for line in lines.push(&buf[..n]) {
                            self.emit(line);
                        }
                    }
                    Err(e) => break ReadOutcome::Failed(e.to_string()),
                },
            }
        };

        if let Some(line) = lines.flush() {
            self.emit(line);
        }
        outcome
    }

    fn is_stale(&self, last_read: DateTime<Utc>) -> bool {
        (self.clock.now() - last_read)
            .to_std()
            .map_or(false, |quiet| quiet >= self.health_check)
    }

    fn emit(&self, line: String) {
        self.store.dispatch(Action::Log(LogAction::info(
            &self.name.resource,
            SpanId::for_pod(&self.name.pod),
            line,
        )));
    }

    fn ended(&self) -> StreamExit {
        StreamExit::Ended {
            at: self.clock.now(),
        }
    }

    async fn fail(&self, message: String) {
        info!(
            pod = %self.name.pod,
            container = %self.container,
            error = %message,
            "Error streaming logs"
        );
        self.store.dispatch(Action::Log(LogAction::info(
            &self.name.resource,
            SpanId::for_pod(&self.name.pod),
            format!("Error streaming {} logs: {message}\n", self.name.pod),
        )));
        self.shared
            .update_status(&self.signal, &self.name, &self.container, |s| {
                s.active = false;
                s.error = Some(message);
            })
            .await;
    }
}

/// Streams the logs of every container of every tracked pod into the store.
pub struct PodLogStreamController {
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    signal: CancelSignal,
    health_check: Duration,
    reconnect_gap: Duration,
    shared: Arc<LogStreamShared>,
}

impl PodLogStreamController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        sink: Arc<dyn StatusSink>,
        clock: Arc<dyn Clock>,
        signal: CancelSignal,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client,
            clock,
            signal,
            health_check: config.pod_log_health_check,
            reconnect_gap: config.pod_log_reconnect_gap,
            shared: Arc::new(LogStreamShared {
                index: Mutex::new(LogStreamIndex::default()),
                sink,
            }),
        }
    }

    /// Current status of a pod's log stream.
    pub async fn status(&self, name: &StreamName) -> Option<PodLogStreamStatus> {
        self.shared.index.lock().await.statuses.get(name).cloned()
    }

    /// Number of container streams still running.
    pub async fn active_stream_count(&self) -> usize {
        self.shared
            .index
            .lock()
            .await
            .watches
            .values()
            .filter(|w| w.exit().is_none())
            .count()
    }

    fn reconcile_stream(
        &self,
        index: &mut LogStreamIndex,
        store: &Arc<Store>,
        spec: &PodLogStreamSpec,
    ) {
        let init: Vec<&Container> = spec
            .init_containers
            .iter()
            .filter(|c| spec.filter.allows(&c.name))
            .collect();
        let run: Vec<&Container> = spec
            .containers
            .iter()
            .filter(|c| spec.filter.allows(&c.name))
            .collect();

        let prefix_run = run.len() > 1;
        let ordered: Vec<(&Container, bool)> = init
            .iter()
            .map(|c| (*c, true))
            .chain(run.iter().map(|c| (*c, prefix_run)))
            .collect();

        let all: Vec<&Container> = ordered.iter().map(|(c, _)| *c).collect();
        index.ensure_status(&spec.name, &all);

        let mut desired = HashSet::new();
        for (container, prefixed) in ordered {
            let key = PodLogKey {
                stream: spec.name.clone(),
                container: container.id.clone(),
            };
            if !index.should_stream(container, &key) {
                continue;
            }
            desired.insert(key.clone());

            let mut since = spec.since;
            match index.watches.get(&key).map(PodLogWatch::exit) {
                None => {}
                // Still streaming.
                Some(None) => continue,
                // Not reopened until the container is replaced.
                Some(Some(StreamExit::Failed)) => continue,
                Some(Some(StreamExit::Ended { at })) => {
                    since = at;

                    // A terminated container has nothing left to read.
                    if container.terminated {
                        index.has_closed_stream.insert(key.clone());
                        index.update_status(&spec.name, &container.name, |s| {
                            s.active = false;
                            s.terminated = true;
                            s.error = None;
                        });
                        continue;
                    }
                }
            }

            info!(
                resource = %spec.name.resource,
                pod = %spec.name.pod,
                container = %container.name,
                "Starting log stream"
            );

            let (handle, signal) = self.signal.child();
            let (exit_tx, exit_rx) = watch::channel(None);
            index.watches.insert(
                key,
                PodLogWatch {
                    container: container.name.clone(),
                    handle,
                    exit: exit_rx,
                },
            );

            let stream = ContainerLogStream {
                shared: Arc::clone(&self.shared),
                client: Arc::clone(&self.client),
                clock: Arc::clone(&self.clock),
                store: Arc::clone(store),
                name: spec.name.clone(),
                namespace: spec.namespace.clone(),
                container: container.name.clone(),
                since,
                prefix: prefixed.then(|| format!("[{}] ", container.name)),
                health_check: self.health_check,
                reconnect_gap: self.reconnect_gap,
                signal,
            };
            tokio::spawn(stream.run(exit_tx));
        }

        let cancelled: Vec<PodLogKey> = index
            .watches
            .keys()
            .filter(|key| key.stream == spec.name && !desired.contains(*key))
            .cloned()
            .collect();
        for key in cancelled {
            let Some(watch) = index.watches.remove(&key) else {
                continue;
            };
            watch.handle.cancel();
            if watch.exit().is_none() {
                index.update_status(&spec.name, &watch.container, |s| s.active = false);
            }
        }
    }
}

#[async_trait]
impl Subscriber for PodLogStreamController {
    fn name(&self) -> &str {
        "pod-log-stream"
    }

    async fn on_change(&self, store: &Arc<Store>) -> Result<(), EngineError> {
        let desired = desired_streams(&*store.read_state().await);

        {
            let mut index = self.shared.index.lock().await;
            for spec in desired.values() {
                self.reconcile_stream(&mut index, store, spec);
            }

            let gone: Vec<StreamName> = index
                .stream_names()
                .into_iter()
                .filter(|name| !desired.contains_key(name))
                .collect();
            for name in &gone {
                debug!(resource = %name.resource, pod = %name.pod, "Stopping log streams");
                index.delete_stream(name);
            }
        }

        for name in desired.keys() {
            self.shared.report(name).await;
        }
        Ok(())
    }

    async fn teardown(&self) {
        let mut index = self.shared.index.lock().await;
        for w in index.watches.values() {
            w.handle.cancel();
        }
        index.watches.clear();
    }
}
