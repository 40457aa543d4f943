//! In-memory cluster for tests and local development.
//!
//! Watches are backed by unbounded channels that tests feed directly, log
//! streams replay scripted chunks, and port forwarders either hold or fail
//! on demand. Every call is recorded so tests can assert on it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tend_id::{ContainerName, Namespace, ObjectUid, PodId};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::client::{
    ClusterClient, EventWatchStream, LogReader, PodWatchStream, PortForwardRequest, PortForwarder,
};
use super::object::{K8sEvent, ObjectMeta, ObjectRef, PodUpdate};
use super::owner::{ObjectRefTree, OwnerFetcher};
use crate::error::ClientError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WatchChannel<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Option<mpsc::UnboundedReceiver<T>>,
}

impl<T> WatchChannel<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }

    /// Hand out the receiving side. A second watch on the same namespace
    /// gets a fresh channel, like a re-established server watch.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<T> {
        match self.rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.tx = tx;
                rx
            }
        }
    }
}

/// How a scripted log stream ends once its chunks are drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEnding {
    /// Clean end of stream.
    Eof,
    /// Never produce another byte.
    Hang,
    /// Fail the next read.
    Error(String),
}

/// A scripted container log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLogs {
    pub chunks: Vec<Vec<u8>>,
    pub ending: LogEnding,
}

impl FakeLogs {
    pub fn eof(text: &str) -> Self {
        Self::new(text, LogEnding::Eof)
    }

    pub fn hang(text: &str) -> Self {
        Self::new(text, LogEnding::Hang)
    }

    pub fn error(text: &str, message: &str) -> Self {
        Self::new(text, LogEnding::Error(message.to_string()))
    }

    fn new(text: &str, ending: LogEnding) -> Self {
        let chunks = if text.is_empty() {
            Vec::new()
        } else {
            vec![text.as_bytes().to_vec()]
        };
        Self { chunks, ending }
    }
}

struct ScriptedReader {
    chunks: VecDeque<Vec<u8>>,
    ending: LogEnding,
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(chunk) = self.chunks.front_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.pop_front();
            }
            return Poll::Ready(Ok(()));
        }

        match &self.ending {
            LogEnding::Eof => Poll::Ready(Ok(())),
            LogEnding::Hang => Poll::Pending,
            LogEnding::Error(message) => Poll::Ready(Err(io::Error::other(message.clone()))),
        }
    }
}

/// A recorded `container_logs` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCall {
    pub pod: PodId,
    pub container: ContainerName,
    pub namespace: Namespace,
    pub since: Option<DateTime<Utc>>,
}

/// Behavior of forwarders created by [`FakeClusterClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeForward {
    /// Forward forever.
    Hold,
    /// Fail immediately with the given message.
    Fail(String),
}

/// Fake [`ClusterClient`].
pub struct FakeClusterClient {
    pod_watches: Mutex<HashMap<Namespace, WatchChannel<PodUpdate>>>,
    event_watches: Mutex<HashMap<Namespace, WatchChannel<K8sEvent>>>,
    forbidden: Mutex<HashSet<Namespace>>,
    pod_watch_calls: Mutex<Vec<Namespace>>,
    event_watch_calls: Mutex<Vec<Namespace>>,
    logs: Mutex<HashMap<(PodId, ContainerName), VecDeque<FakeLogs>>>,
    log_calls: Mutex<Vec<LogCall>>,
    forward: Mutex<FakeForward>,
    forward_calls: Mutex<Vec<PortForwardRequest>>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self {
            pod_watches: Mutex::new(HashMap::new()),
            event_watches: Mutex::new(HashMap::new()),
            forbidden: Mutex::new(HashSet::new()),
            pod_watch_calls: Mutex::new(Vec::new()),
            event_watch_calls: Mutex::new(Vec::new()),
            logs: Mutex::new(HashMap::new()),
            log_calls: Mutex::new(Vec::new()),
            forward: Mutex::new(FakeForward::Hold),
            forward_calls: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a pod change on the namespace's watch.
    pub fn push_pod(&self, namespace: &Namespace, update: PodUpdate) {
        let mut watches = lock(&self.pod_watches);
        let channel = watches
            .entry(namespace.clone())
            .or_insert_with(WatchChannel::new);
        let _ = channel.tx.send(update);
    }

    /// Deliver an event on the namespace's watch.
    pub fn push_event(&self, namespace: &Namespace, event: K8sEvent) {
        let mut watches = lock(&self.event_watches);
        let channel = watches
            .entry(namespace.clone())
            .or_insert_with(WatchChannel::new);
        let _ = channel.tx.send(event);
    }

    /// End the current pod watch on a namespace, as a server timeout would.
    pub fn close_pod_watch(&self, namespace: &Namespace) {
        lock(&self.pod_watches).remove(namespace);
    }

    /// Make watches on a namespace fail with `Forbidden`.
    pub fn forbid_namespace(&self, namespace: &Namespace) {
        lock(&self.forbidden).insert(namespace.clone());
    }

    /// Undo [`forbid_namespace`](Self::forbid_namespace).
    pub fn allow_namespace(&self, namespace: &Namespace) {
        lock(&self.forbidden).remove(namespace);
    }

    pub fn pod_watch_calls(&self) -> Vec<Namespace> {
        lock(&self.pod_watch_calls).clone()
    }

    pub fn event_watch_calls(&self) -> Vec<Namespace> {
        lock(&self.event_watch_calls).clone()
    }

    /// Queue the log returned by the next `container_logs` call for a
    /// container. Unscripted calls get a stream that never produces output.
    pub fn push_logs(&self, pod: &PodId, container: &ContainerName, logs: FakeLogs) {
        lock(&self.logs)
            .entry((pod.clone(), container.clone()))
            .or_default()
            .push_back(logs);
    }

    pub fn log_calls(&self) -> Vec<LogCall> {
        lock(&self.log_calls).clone()
    }

    pub fn set_forward(&self, behavior: FakeForward) {
        *lock(&self.forward) = behavior;
    }

    pub fn forward_calls(&self) -> Vec<PortForwardRequest> {
        lock(&self.forward_calls).clone()
    }

    fn check_forbidden(&self, namespace: &Namespace) -> Result<(), ClientError> {
        if lock(&self.forbidden).contains(namespace) {
            return Err(ClientError::Forbidden(format!(
                "cannot watch resources in namespace {namespace}"
            )));
        }
        Ok(())
    }
}

impl Default for FakeClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn watch_pods(&self, namespace: &Namespace) -> Result<PodWatchStream, ClientError> {
        lock(&self.pod_watch_calls).push(namespace.clone());
        self.check_forbidden(namespace)?;

        let rx = lock(&self.pod_watches)
            .entry(namespace.clone())
            .or_insert_with(WatchChannel::new)
            .subscribe();

        debug!(namespace = %namespace, "[FAKE] Watching pods");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn watch_events(&self, namespace: &Namespace) -> Result<EventWatchStream, ClientError> {
        lock(&self.event_watch_calls).push(namespace.clone());
        self.check_forbidden(namespace)?;

        let rx = lock(&self.event_watches)
            .entry(namespace.clone())
            .or_insert_with(WatchChannel::new)
            .subscribe();

        debug!(namespace = %namespace, "[FAKE] Watching events");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn container_logs(
        &self,
        pod: &PodId,
        container: &ContainerName,
        namespace: &Namespace,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogReader, ClientError> {
        lock(&self.log_calls).push(LogCall {
            pod: pod.clone(),
            container: container.clone(),
            namespace: namespace.clone(),
            since,
        });

        let script = lock(&self.logs)
            .get_mut(&(pod.clone(), container.clone()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| FakeLogs::hang(""));

        Ok(Box::pin(ScriptedReader {
            chunks: script.chunks.into_iter().filter(|c| !c.is_empty()).collect(),
            ending: script.ending,
        }))
    }

    async fn create_port_forwarder(
        &self,
        request: &PortForwardRequest,
    ) -> Result<Box<dyn PortForwarder>, ClientError> {
        lock(&self.forward_calls).push(request.clone());
        let behavior = lock(&self.forward).clone();
        Ok(Box::new(FakePortForwarder { behavior }))
    }
}

struct FakePortForwarder {
    behavior: FakeForward,
}

#[async_trait]
impl PortForwarder for FakePortForwarder {
    async fn forward_ports(&mut self) -> Result<(), ClientError> {
        match &self.behavior {
            FakeForward::Hold => std::future::pending().await,
            FakeForward::Fail(message) => Err(ClientError::Transient(message.clone())),
        }
    }
}

/// Fake [`OwnerFetcher`] backed by a static owner graph.
pub struct FakeOwnerFetcher {
    owners: Mutex<HashMap<ObjectUid, Vec<ObjectRef>>>,
    failing: Mutex<HashSet<ObjectUid>>,
}

/// Owner graphs deeper than this are assumed to be cyclic.
const MAX_OWNER_DEPTH: usize = 16;

impl FakeOwnerFetcher {
    pub fn new() -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Register the direct owners of an object.
    pub fn set_owners(&self, uid: &ObjectUid, owners: Vec<ObjectRef>) {
        lock(&self.owners).insert(uid.clone(), owners);
    }

    /// Make lookups for an object fail with `NotFound`.
    pub fn fail_for(&self, uid: &ObjectUid) {
        lock(&self.failing).insert(uid.clone());
    }

    fn check_failing(&self, uid: &ObjectUid) -> Result<(), ClientError> {
        if lock(&self.failing).contains(uid) {
            return Err(ClientError::NotFound(format!("object {uid}")));
        }
        Ok(())
    }

    fn build(&self, object: ObjectRef, direct: Vec<ObjectRef>, depth: usize) -> ObjectRefTree {
        if depth >= MAX_OWNER_DEPTH {
            return ObjectRefTree::leaf(object);
        }

        let owners = direct
            .into_iter()
            .map(|owner| {
                let next = lock(&self.owners)
                    .get(&owner.uid)
                    .cloned()
                    .unwrap_or_default();
                self.build(owner, next, depth + 1)
            })
            .collect();

        ObjectRefTree { object, owners }
    }
}

impl Default for FakeOwnerFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OwnerFetcher for FakeOwnerFetcher {
    async fn owner_tree_of(
        &self,
        meta: &ObjectMeta,
        kind: &str,
    ) -> Result<ObjectRefTree, ClientError> {
        self.check_failing(&meta.uid)?;

        let object = ObjectRef::new(
            kind,
            meta.name.clone(),
            meta.namespace.clone(),
            meta.uid.clone(),
        );
        let direct = if meta.owner_references.is_empty() {
            lock(&self.owners)
                .get(&meta.uid)
                .cloned()
                .unwrap_or_default()
        } else {
            meta.owner_references.clone()
        };

        Ok(self.build(object, direct, 0))
    }

    async fn owner_tree_of_ref(&self, object: &ObjectRef) -> Result<ObjectRefTree, ClientError> {
        self.check_failing(&object.uid)?;

        let direct = lock(&self.owners)
            .get(&object.uid)
            .cloned()
            .unwrap_or_default();

        Ok(self.build(object.clone(), direct, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncReadExt;

    use crate::k8s::object::Pod;

    #[tokio::test]
    async fn test_pod_watch_delivers_pushed_updates() {
        let client = FakeClusterClient::new();
        let ns = Namespace::new("default");

        client.push_pod(
            &ns,
            PodUpdate::Upsert(Pod::new("early", ns.clone(), ObjectUid::new("u0"))),
        );
        let mut stream = client.watch_pods(&ns).await.unwrap();
        client.push_pod(
            &ns,
            PodUpdate::Deleted {
                namespace: ns.clone(),
                name: PodId::new("early"),
            },
        );

        assert!(matches!(stream.next().await, Some(PodUpdate::Upsert(_))));
        assert!(matches!(stream.next().await, Some(PodUpdate::Deleted { .. })));

        client.close_pod_watch(&ns);
        assert!(stream.next().await.is_none());
        assert_eq!(client.pod_watch_calls(), vec![ns]);
    }

    #[tokio::test]
    async fn test_forbidden_watch() {
        let client = FakeClusterClient::new();
        let ns = Namespace::new("locked");
        client.forbid_namespace(&ns);

        let err = client.watch_events(&ns).await.err().unwrap();
        assert!(matches!(err, ClientError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_scripted_logs() {
        let client = FakeClusterClient::new();
        let pod = PodId::new("web-1");
        let container = ContainerName::new("app");
        client.push_logs(&pod, &container, FakeLogs::eof("hello\nworld\n"));

        let mut reader = client
            .container_logs(&pod, &container, &Namespace::new("default"), None)
            .await
            .unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "hello\nworld\n");
        assert_eq!(client.log_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_log_error() {
        let client = FakeClusterClient::new();
        let pod = PodId::new("web-1");
        let container = ContainerName::new("app");
        client.push_logs(&pod, &container, FakeLogs::error("partial", "reset by peer"));

        let mut reader = client
            .container_logs(&pod, &container, &Namespace::new("default"), None)
            .await
            .unwrap();
        let mut out = String::new();
        assert!(reader.read_to_string(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_owner_tree() {
        let fetcher = FakeOwnerFetcher::new();
        let ns = Namespace::new("default");
        let rs = ObjectRef::new("ReplicaSet", "web-rs", ns.clone(), ObjectUid::new("rs"));
        let deploy = ObjectRef::new("Deployment", "web", ns.clone(), ObjectUid::new("deploy"));
        fetcher.set_owners(&rs.uid, vec![deploy]);

        let pod = Pod::new("web-1", ns, ObjectUid::new("pod")).with_owner(rs);
        let tree = fetcher.owner_tree_of(&pod.meta, "Pod").await.unwrap();

        let uids: Vec<String> = tree.uids().iter().map(|u| u.to_string()).collect();
        assert_eq!(uids, vec!["pod", "rs", "deploy"]);
    }

    #[tokio::test]
    async fn test_failing_forwarder() {
        let client = FakeClusterClient::new();
        client.set_forward(FakeForward::Fail("connection refused".to_string()));

        let request = PortForwardRequest {
            namespace: Namespace::new("default"),
            pod: PodId::new("web-1"),
            local_port: 8080,
            container_port: 80,
            host: "localhost".to_string(),
        };
        let mut forwarder = client.create_port_forwarder(&request).await.unwrap();
        assert!(forwarder.forward_ports().await.is_err());
        assert_eq!(client.forward_calls(), vec![request]);
    }
}
