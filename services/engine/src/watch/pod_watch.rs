//! Pod watcher: keeps one pod watch per relevant namespace and attributes
//! every observed pod to a resource.
//!
//! A pod can be observed before the deploy that created it is recorded. The
//! watcher remembers every pod it has seen and, for each ancestor, which
//! pods descend from it; when a new deployed UID shows up, the pods beneath
//! it are replayed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tend_id::{Namespace, ObjectUid, PodId, ResourceName};
use tend_reconcile::{Backoff, BackoffPolicy, CancelSignal};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::index::DescendantIndex;
use super::known_state::WatcherKnownState;
use super::triage::{triage, ExtraSelector, MatchStrategy, TriageInput, TriageMatch};
use crate::error::EngineError;
use crate::k8s::{ClusterClient, ObjectRefTree, OwnerFetcher, Pod, PodUpdate, PodWatchStream};
use crate::store::{Action, ErrorAction, PodChangeAction, PodDeleteAction, Store, Subscriber};

/// Everything the pod watcher knows, guarded by one lock.
#[derive(Debug, Default)]
struct PodIndex {
    known: WatcherKnownState,
    extra_selectors: Vec<ExtraSelector>,
    descendants: DescendantIndex,
    pods: HashMap<ObjectUid, Pod>,
}

impl PodIndex {
    fn upsert(&mut self, pod: Pod) {
        self.pods.insert(pod.meta.uid.clone(), pod);
    }

    fn remove(&mut self, namespace: &Namespace, name: &PodId) {
        self.pods
            .retain(|_, pod| !(&pod.meta.namespace == namespace && pod.meta.name == name.as_str()));
    }

    /// Record the pod's ancestry, then attribute it.
    fn triage(&mut self, pod: &Pod, tree: &ObjectRefTree) -> Option<TriageMatch> {
        let chain = tree.uids();
        // The pod's own UID is matched against deployed UIDs directly on
        // replay, so only its owners go in the index.
        self.descendants.record(chain.iter().skip(1), &pod.meta.uid);

        let strategies = [
            MatchStrategy::OwnerChain {
                deployed: self.known.known_deployed_uids(),
            },
            MatchStrategy::ExtraSelectors {
                selectors: &self.extra_selectors,
            },
        ];
        triage(
            &strategies,
            &TriageInput {
                chain: &chain,
                labels: Some(&pod.meta.labels),
            },
        )
    }

    fn forget_namespace(&mut self, namespace: &Namespace) {
        let gone: HashSet<ObjectUid> = self
            .pods
            .values()
            .filter(|pod| &pod.meta.namespace == namespace)
            .map(|pod| pod.meta.uid.clone())
            .collect();

        self.pods.retain(|uid, _| !gone.contains(uid));
        self.descendants.forget(&gone);
    }
}

/// Shared handles for the watch and dispatch tasks.
#[derive(Clone)]
struct PodWatchContext {
    client: Arc<dyn ClusterClient>,
    owner_fetcher: Arc<dyn OwnerFetcher>,
    index: Arc<RwLock<PodIndex>>,
    store: Arc<Store>,
    backoff: BackoffPolicy,
}

impl PodWatchContext {
    async fn run(self, namespace: Namespace, mut stream: PodWatchStream, signal: CancelSignal) {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            loop {
                let update = tokio::select! {
                    _ = signal.cancelled() => return,
                    update = stream.next() => update,
                };

                match update {
                    Some(PodUpdate::Upsert(pod)) => {
                        self.index.write().await.upsert(pod.clone());
                        let ctx = self.clone();
                        tokio::spawn(async move { ctx.dispatch_pod_change(pod).await });
                    }
                    Some(PodUpdate::Deleted { namespace, name }) => {
                        self.index.write().await.remove(&namespace, &name);
                        self.store.dispatch(Action::PodDelete(PodDeleteAction {
                            pod_id: name,
                            namespace,
                        }));
                    }
                    None => break,
                }
            }

            warn!(namespace = %namespace, "Pod watch closed, re-establishing");

            match self.connect(&namespace, &signal, &mut backoff).await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    /// Keep retrying `watch_pods` with backoff until it succeeds or the
    /// watch is cancelled.
    async fn connect(
        &self,
        namespace: &Namespace,
        signal: &CancelSignal,
        backoff: &mut Backoff,
    ) -> Option<PodWatchStream> {
        loop {
            let delay = backoff.step();
            tokio::select! {
                _ = signal.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.client.watch_pods(namespace).await {
                Ok(stream) => {
                    backoff.reset();
                    return Some(stream);
                }
                Err(e) => {
                    debug!(namespace = %namespace, error = %e, "Pod watch still unavailable");
                }
            }
        }
    }

    /// Retry a watch that failed to start, then run it.
    async fn retry_setup(self, namespace: Namespace, signal: CancelSignal) {
        let mut backoff = Backoff::new(self.backoff.clone());
        let Some(stream) = self.connect(&namespace, &signal, &mut backoff).await else {
            return;
        };

        {
            let mut index = self.index.write().await;
            if signal.is_cancelled() || !index.known.promote_retry(&namespace) {
                return;
            }
        }

        info!(namespace = %namespace, "Watching pods");
        self.run(namespace, stream, signal).await;
    }

    async fn dispatch_pod_change(&self, pod: Pod) {
        let tree = match self.owner_fetcher.owner_tree_of(&pod.meta, "Pod").await {
            Ok(tree) => tree,
            Err(e) => {
                // Deleted pods routinely race with their owner lookup.
                if !e.is_not_found() {
                    info!(pod = %pod.meta.name, error = %e, "Failed to resolve pod owners");
                }
                return;
            }
        };

        let index = &mut *self.index.write().await;
        let Some(matched) = index.triage(&pod, &tree) else {
            return;
        };

        // Send the latest version; the pod may have changed or been deleted
        // while owners were resolved.
        let Some(fresh) = index.pods.get(&pod.meta.uid) else {
            return;
        };

        self.store.dispatch(Action::PodChange(PodChangeAction::new(
            fresh.clone(),
            matched.resource,
            matched.ancestor,
        )));
    }
}

/// Watches pods and dispatches a change action for every pod that belongs
/// to a resource.
pub struct PodWatcher {
    client: Arc<dyn ClusterClient>,
    owner_fetcher: Arc<dyn OwnerFetcher>,
    signal: CancelSignal,
    backoff: BackoffPolicy,
    index: Arc<RwLock<PodIndex>>,
}

impl PodWatcher {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        owner_fetcher: Arc<dyn OwnerFetcher>,
        signal: CancelSignal,
    ) -> Self {
        Self {
            client,
            owner_fetcher,
            signal,
            backoff: BackoffPolicy::default(),
            index: Arc::new(RwLock::new(PodIndex::default())),
        }
    }

    /// Retry policy for re-establishing closed watches.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Namespaces currently watched.
    pub async fn watched_namespaces(&self) -> Vec<Namespace> {
        self.index.read().await.known.watched_namespaces()
    }

    /// Number of pods remembered for replay.
    pub async fn known_pod_count(&self) -> usize {
        self.index.read().await.pods.len()
    }

    fn context(&self, store: &Arc<Store>) -> PodWatchContext {
        PodWatchContext {
            client: Arc::clone(&self.client),
            owner_fetcher: Arc::clone(&self.owner_fetcher),
            index: Arc::clone(&self.index),
            store: Arc::clone(store),
            backoff: self.backoff.clone(),
        }
    }

    /// Start a namespace watch. On failure the error is surfaced once and
    /// setup continues in the background with backoff.
    async fn setup_watch(&self, index: &mut PodIndex, store: &Arc<Store>, namespace: Namespace) {
        let (handle, signal) = self.signal.child();
        let ctx = self.context(store);

        match self.client.watch_pods(&namespace).await {
            Ok(stream) => {
                info!(namespace = %namespace, "Watching pods");
                index.known.register_watch(namespace.clone(), handle);
                tokio::spawn(ctx.run(namespace, stream, signal));
            }
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to watch pods");
                store.dispatch(Action::Error(ErrorAction::new(format!(
                    "Error watching pods. Are you connected to kubernetes?\n\
                     Try running `kubectl get pods -n {namespace:?}`: {e}"
                ))));
                index.known.register_retry(namespace.clone(), handle);
                tokio::spawn(ctx.retry_setup(namespace, signal));
            }
        }
    }

    /// Replay known pods beneath newly deployed UIDs. Each pod is
    /// dispatched at most once per call.
    fn setup_new_uids(
        &self,
        index: &mut PodIndex,
        store: &Arc<Store>,
        new_uids: BTreeMap<ObjectUid, ResourceName>,
    ) {
        let mut replay: BTreeMap<ObjectUid, (ResourceName, ObjectUid)> = BTreeMap::new();

        for (uid, resource) in new_uids {
            index.known.record_uid(uid.clone(), resource.clone());

            // The deployed object may itself be a pod.
            if index.pods.contains_key(&uid) {
                replay
                    .entry(uid.clone())
                    .or_insert_with(|| (resource.clone(), uid.clone()));
                continue;
            }

            for pod_uid in index.descendants.descendants_of(&uid) {
                replay
                    .entry(pod_uid.clone())
                    .or_insert_with(|| (resource.clone(), uid.clone()));
            }
        }

        for (pod_uid, (resource, ancestor)) in replay {
            let Some(pod) = index.pods.get(&pod_uid) else {
                continue;
            };
            debug!(pod = %pod.meta.name, resource = %resource, "Replaying pod for new deploy");
            store.dispatch(Action::PodChange(PodChangeAction::new(
                pod.clone(),
                resource,
                Some(ancestor),
            )));
        }
    }
}

#[async_trait]
impl Subscriber for PodWatcher {
    fn name(&self) -> &str {
        "pod-watcher"
    }

    async fn on_change(&self, store: &Arc<Store>) -> Result<(), EngineError> {
        let (tasks, extra_selectors) = {
            let state = store.read_state().await;
            let index = self.index.read().await;
            let tasks = index.known.create_task_list(&state);

            let extra_selectors: Vec<ExtraSelector> = state
                .k8s_targets()
                .filter_map(|(mt, _)| mt.manifest.k8s_target().map(|t| (mt, t)))
                .flat_map(|(mt, target)| {
                    target
                        .extra_pod_selectors
                        .iter()
                        .filter(|s| !s.is_empty())
                        .map(|selector| ExtraSelector {
                            resource: mt.manifest.name.clone(),
                            selector: selector.clone(),
                        })
                })
                .collect();

            (tasks, extra_selectors)
        };

        let mut index = self.index.write().await;
        index.extra_selectors = extra_selectors;

        if tasks.is_empty() {
            return Ok(());
        }

        for namespace in &tasks.teardown_namespaces {
            info!(namespace = %namespace, "Stopping pod watch");
            index.known.teardown_namespace(namespace);
            index.forget_namespace(namespace);
        }

        for namespace in tasks.setup_namespaces {
            self.setup_watch(&mut index, store, namespace).await;
        }

        for uid in &tasks.stale_uids {
            index.known.forget_uid(uid);
        }

        if !tasks.new_uids.is_empty() {
            self.setup_new_uids(&mut index, store, tasks.new_uids);
        }

        Ok(())
    }

    async fn teardown(&self) {
        let mut index = self.index.write().await;
        index.known.teardown_all();
        index.pods.clear();
        index.descendants = DescendantIndex::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::watch;

    use crate::k8s::{FakeClusterClient, FakeOwnerFetcher, LabelSelector, ObjectRef};
    use crate::model::{K8sTarget, Manifest};
    use crate::store::{DeployedRef, EngineState, K8sDeployedAction, PodAncestor};

    struct Harness {
        client: Arc<FakeClusterClient>,
        owners: Arc<FakeOwnerFetcher>,
        store: Arc<Store>,
        watcher: PodWatcher,
        _shutdown: watch::Sender<bool>,
    }

    fn ns() -> Namespace {
        Namespace::new("default")
    }

    fn harness(target: K8sTarget) -> Harness {
        let client = Arc::new(FakeClusterClient::new());
        let owners = Arc::new(FakeOwnerFetcher::new());
        let store = Store::new(EngineState::new(Utc::now(), ns(), 1000));
        store.dispatch(Action::ManifestUpsert(Manifest::k8s("web", target)));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let watcher = PodWatcher::new(
            client.clone(),
            owners.clone(),
            CancelSignal::root(shutdown_rx),
        );

        Harness {
            client,
            owners,
            store,
            watcher,
            _shutdown: shutdown,
        }
    }

    fn deploy(store: &Store, uid: &str) {
        deploy_refs(store, &[("Deployment", uid)]);
    }

    fn deploy_refs(store: &Store, refs: &[(&str, &str)]) {
        store.dispatch(Action::K8sDeployed(K8sDeployedAction {
            resource: ResourceName::new("web"),
            refs: refs
                .iter()
                .map(|(kind, uid)| DeployedRef {
                    kind: kind.to_string(),
                    name: "web".to_string(),
                    namespace: ns(),
                    uid: ObjectUid::new(*uid),
                })
                .collect(),
            pod_template_hashes: BTreeSet::new(),
            at: Utc::now(),
        }));
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    /// Pod owned by `rs`, which is owned by `deploy-1`.
    fn owned_pod(h: &Harness, name: &str) -> Pod {
        let rs = ObjectRef::new("ReplicaSet", "web-rs", ns(), ObjectUid::new("rs"));
        let deployment = ObjectRef::new("Deployment", "web", ns(), ObjectUid::new("deploy-1"));
        h.owners.set_owners(&rs.uid, vec![deployment]);
        Pod::new(name, ns(), ObjectUid::new(format!("uid-{name}"))).with_owner(rs)
    }

    async fn wait_for(store: &Arc<Store>, condition: impl Fn(&EngineState) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                store.apply_pending().await;
                if condition(&*store.read_state().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn tracked_pods(state: &EngineState) -> Vec<String> {
        state
            .manifest_target(&ResourceName::new("web"))
            .and_then(|mt| mt.state.k8s_runtime())
            .map(|r| r.pods.keys().map(|k| k.to_string()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_pod_attributed_through_owner_chain() {
        let h = harness(K8sTarget::default());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;

        h.watcher.on_change(&h.store).await.unwrap();
        assert_eq!(h.watcher.watched_namespaces().await, vec![ns()]);

        h.client.push_pod(&ns(), PodUpdate::Upsert(owned_pod(&h, "web-1")));

        wait_for(&h.store, |s| tracked_pods(s) == vec!["web-1"]).await;

        let state = h.store.read_state().await;
        let runtime = state
            .manifest_target(&ResourceName::new("web"))
            .and_then(|mt| mt.state.k8s_runtime())
            .unwrap();
        assert_eq!(
            runtime.pod_ancestor,
            PodAncestor::Owner(ObjectUid::new("deploy-1"))
        );
    }

    #[tokio::test]
    async fn test_pod_seen_before_deploy_is_replayed() {
        let h = harness(K8sTarget {
            namespaces: vec![ns()],
            ..K8sTarget::default()
        });
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        h.client.push_pod(&ns(), PodUpdate::Upsert(owned_pod(&h, "web-1")));

        // Observed, but not attributable yet.
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.watcher.known_pod_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.store.apply_pending().await;
        assert!(tracked_pods(&*h.store.read_state().await).is_empty());

        // Both deployed objects are ancestors of the pod; it is replayed
        // once, and only for the first change that reveals them.
        deploy_refs(&h.store, &[("Deployment", "deploy-1"), ("ReplicaSet", "rs")]);
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();
        assert_eq!(h.store.apply_pending().await, 1);
        assert_eq!(tracked_pods(&*h.store.read_state().await), vec!["web-1"]);

        h.watcher.on_change(&h.store).await.unwrap();
        assert_eq!(h.store.apply_pending().await, 0);
    }

    #[tokio::test]
    async fn test_extra_selector_match() {
        let h = harness(K8sTarget {
            namespaces: vec![ns()],
            extra_pod_selectors: vec![LabelSelector::from_pairs([("app", "web")])],
            ..K8sTarget::default()
        });
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        let orphan = Pod::new("standalone", ns(), ObjectUid::new("uid-standalone"))
            .with_label("app", "web");
        h.client.push_pod(&ns(), PodUpdate::Upsert(orphan));

        wait_for(&h.store, |s| tracked_pods(s) == vec!["standalone"]).await;
    }

    #[tokio::test]
    async fn test_unmatched_pod_ignored() {
        let h = harness(K8sTarget::default());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        let stranger = Pod::new("other", ns(), ObjectUid::new("uid-other"));
        h.client.push_pod(&ns(), PodUpdate::Upsert(stranger));

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.store.apply_pending().await;
        assert!(tracked_pods(&*h.store.read_state().await).is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_pod() {
        let h = harness(K8sTarget::default());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        h.client.push_pod(&ns(), PodUpdate::Upsert(owned_pod(&h, "web-1")));
        wait_for(&h.store, |s| !tracked_pods(s).is_empty()).await;

        h.client.push_pod(
            &ns(),
            PodUpdate::Deleted {
                namespace: ns(),
                name: PodId::new("web-1"),
            },
        );
        wait_for(&h.store, |s| tracked_pods(s).is_empty()).await;
        assert_eq!(h.watcher.known_pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_watch_failure_reported_once() {
        let h = harness(K8sTarget::default());
        h.client.forbid_namespace(&ns());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;

        h.watcher.on_change(&h.store).await.unwrap();
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();
        h.store.apply_pending().await;

        let state = h.store.read_state().await;
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].starts_with("Error watching pods"));
        assert_eq!(h.client.pod_watch_calls().len(), 1);
        assert!(h.watcher.watched_namespaces().await.is_empty());
        assert!(h.watcher.index.read().await.known.is_retrying(&ns()));
    }

    #[tokio::test]
    async fn test_failed_watch_retried_in_background() {
        let mut h = harness(K8sTarget::default());
        h.watcher = h.watcher.with_backoff(fast_backoff());
        h.client.forbid_namespace(&ns());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.client.pod_watch_calls().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.store.apply_pending().await;
        assert_eq!(h.store.read_state().await.errors.len(), 1);

        h.client.allow_namespace(&ns());
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.watcher.watched_namespaces().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!h.watcher.index.read().await.known.is_retrying(&ns()));

        h.client.push_pod(&ns(), PodUpdate::Upsert(owned_pod(&h, "web-1")));
        wait_for(&h.store, |s| tracked_pods(s) == vec!["web-1"]).await;
    }

    #[tokio::test]
    async fn test_failed_watch_dropped_with_namespace() {
        let mut h = harness(K8sTarget::default());
        h.watcher = h.watcher.with_backoff(fast_backoff());
        h.client.forbid_namespace(&ns());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        h.store.dispatch(Action::ManifestRemove(ResourceName::new("web")));
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();
        assert!(!h.watcher.index.read().await.known.is_retrying(&ns()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = h.client.pod_watch_calls().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.client.pod_watch_calls().len(), calls);
    }

    #[tokio::test]
    async fn test_namespace_teardown() {
        let h = harness(K8sTarget::default());
        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        h.client.push_pod(&ns(), PodUpdate::Upsert(owned_pod(&h, "web-1")));
        wait_for(&h.store, |s| !tracked_pods(s).is_empty()).await;

        h.store.dispatch(Action::ManifestRemove(ResourceName::new("web")));
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        assert!(h.watcher.watched_namespaces().await.is_empty());
        assert_eq!(h.watcher.known_pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_watch_is_reestablished() {
        let mut h = harness(K8sTarget::default());
        h.watcher = h.watcher.with_backoff(fast_backoff());

        deploy(&h.store, "deploy-1");
        h.store.apply_pending().await;
        h.watcher.on_change(&h.store).await.unwrap();

        h.client.close_pod_watch(&ns());

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.client.pod_watch_calls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.client.push_pod(&ns(), PodUpdate::Upsert(owned_pod(&h, "web-1")));
        wait_for(&h.store, |s| tracked_pods(s) == vec!["web-1"]).await;
    }
}
