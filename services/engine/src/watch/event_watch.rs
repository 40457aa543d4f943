//! Event watcher: surfaces Kubernetes events about a resource's objects in
//! that resource's log.
//!
//! Events are attributed through the involved object's owner chain. As with
//! pods, events seen before the matching deploy is recorded are replayed
//! once it is.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tend_id::{Namespace, ObjectUid, ResourceName};
use tend_reconcile::{Backoff, BackoffPolicy, CancelSignal};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::index::DescendantIndex;
use super::known_state::WatcherKnownState;
use super::triage::{triage, MatchStrategy, TriageInput};
use crate::error::EngineError;
use crate::k8s::{ClusterClient, EventWatchStream, K8sEvent, OwnerFetcher};
use crate::store::{Action, ErrorAction, K8sEventAction, Store, Subscriber};

#[derive(Debug, Default)]
struct EventIndex {
    known: WatcherKnownState,
    descendants: DescendantIndex,
    events: HashMap<ObjectUid, K8sEvent>,
}

impl EventIndex {
    fn forget_namespace(&mut self, namespace: &Namespace) {
        let gone: HashSet<ObjectUid> = self
            .events
            .values()
            .filter(|event| &event.meta.namespace == namespace)
            .map(|event| event.meta.uid.clone())
            .collect();

        self.events.retain(|uid, _| !gone.contains(uid));
        self.descendants.forget(&gone);
    }
}

#[derive(Clone)]
struct EventWatchContext {
    client: Arc<dyn ClusterClient>,
    owner_fetcher: Arc<dyn OwnerFetcher>,
    index: Arc<RwLock<EventIndex>>,
    store: Arc<Store>,
    backoff: BackoffPolicy,
    /// Events created before this are history, not news.
    start_time: DateTime<Utc>,
}

impl EventWatchContext {
    async fn run(self, namespace: Namespace, mut stream: EventWatchStream, signal: CancelSignal) {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            loop {
                let event = tokio::select! {
                    _ = signal.cancelled() => return,
                    event = stream.next() => event,
                };

                let Some(event) = event else {
                    break;
                };

                if event.meta.creation_timestamp < self.start_time || !event.should_log() {
                    continue;
                }

                self.index
                    .write()
                    .await
                    .events
                    .insert(event.meta.uid.clone(), event.clone());

                let ctx = self.clone();
                tokio::spawn(async move { ctx.dispatch_event(event).await });
            }

            warn!(namespace = %namespace, "Event watch closed, re-establishing");

            match self.connect(&namespace, &signal, &mut backoff).await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    async fn connect(
        &self,
        namespace: &Namespace,
        signal: &CancelSignal,
        backoff: &mut Backoff,
    ) -> Option<EventWatchStream> {
        loop {
            let delay = backoff.step();
            tokio::select! {
                _ = signal.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.client.watch_events(namespace).await {
                Ok(stream) => {
                    backoff.reset();
                    return Some(stream);
                }
                Err(e) => {
                    debug!(namespace = %namespace, error = %e, "Event watch still unavailable");
                }
            }
        }
    }

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

        info!(namespace = %namespace, "Watching events");
        self.run(namespace, stream, signal).await;
    }

    async fn dispatch_event(&self, event: K8sEvent) {
        let tree = match self
            .owner_fetcher
            .owner_tree_of_ref(&event.involved_object)
            .await
        {
            Ok(tree) => tree,
            Err(e) => {
                debug!(event = %event.meta.name, error = %e, "Failed to resolve event owners");
                return;
            }
        };

        let index = &mut *self.index.write().await;
        let chain = tree.uids();
        index.descendants.record(chain.iter(), &event.meta.uid);

        let matched = triage(
            &[MatchStrategy::OwnerChain {
                deployed: index.known.known_deployed_uids(),
            }],
            &TriageInput {
                chain: &chain,
                labels: None,
            },
        );
        let Some(matched) = matched else {
            return;
        };

        self.store.dispatch(Action::K8sEvent(K8sEventAction {
            event,
            resource: matched.resource,
        }));
    }
}

/// Watches events and routes them to the resource whose objects they
/// concern.
pub struct EventWatchManager {
    client: Arc<dyn ClusterClient>,
    owner_fetcher: Arc<dyn OwnerFetcher>,
    signal: CancelSignal,
    backoff: BackoffPolicy,
    index: Arc<RwLock<EventIndex>>,
}

impl EventWatchManager {
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
            index: Arc::new(RwLock::new(EventIndex::default())),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn watched_namespaces(&self) -> Vec<Namespace> {
        self.index.read().await.known.watched_namespaces()
    }

    pub async fn known_event_count(&self) -> usize {
        self.index.read().await.events.len()
    }

    async fn setup_watch(
        &self,
        index: &mut EventIndex,
        store: &Arc<Store>,
        namespace: Namespace,
        start_time: DateTime<Utc>,
    ) {
        let (handle, signal) = self.signal.child();
        let ctx = EventWatchContext {
            client: Arc::clone(&self.client),
            owner_fetcher: Arc::clone(&self.owner_fetcher),
            index: Arc::clone(&self.index),
            store: Arc::clone(store),
            backoff: self.backoff.clone(),
            start_time,
        };

        match self.client.watch_events(&namespace).await {
            Ok(stream) => {
                info!(namespace = %namespace, "Watching events");
                index.known.register_watch(namespace.clone(), handle);
                tokio::spawn(ctx.run(namespace, stream, signal));
            }
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to watch events");
                store.dispatch(Action::Error(ErrorAction::new(format!(
                    "Error watching events. Are you connected to kubernetes?\n\
                     Try running `kubectl get events -n {namespace:?}`: {e}"
                ))));
                index.known.register_retry(namespace.clone(), handle);
                tokio::spawn(ctx.retry_setup(namespace, signal));
            }
        }
    }

    fn setup_new_uids(
        &self,
        index: &mut EventIndex,
        store: &Arc<Store>,
        new_uids: BTreeMap<ObjectUid, ResourceName>,
    ) {
        let mut replay: BTreeMap<ObjectUid, ResourceName> = BTreeMap::new();

        for (uid, resource) in new_uids {
            index.known.record_uid(uid.clone(), resource.clone());
            for event_uid in index.descendants.descendants_of(&uid) {
                replay
                    .entry(event_uid.clone())
                    .or_insert_with(|| resource.clone());
            }
        }

        for (event_uid, resource) in replay {
            let Some(event) = index.events.get(&event_uid) else {
                continue;
            };
            store.dispatch(Action::K8sEvent(K8sEventAction {
                event: event.clone(),
                resource,
            }));
        }
    }
}

#[async_trait]
impl Subscriber for EventWatchManager {
    fn name(&self) -> &str {
        "event-watcher"
    }

    async fn on_change(&self, store: &Arc<Store>) -> Result<(), EngineError> {
        let (tasks, start_time) = {
            let state = store.read_state().await;
            let index = self.index.read().await;
            (index.known.create_task_list(&state), state.start_time)
        };

        if tasks.is_empty() {
            return Ok(());
        }

        let mut index = self.index.write().await;

        for namespace in &tasks.teardown_namespaces {
            info!(namespace = %namespace, "Stopping event watch");
            index.known.teardown_namespace(namespace);
            index.forget_namespace(namespace);
        }

        for namespace in tasks.setup_namespaces {
            self.setup_watch(&mut index, store, namespace, start_time)
                .await;
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
        index.events.clear();
        index.descendants = DescendantIndex::default();
    }
}
