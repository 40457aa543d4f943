//! What a watcher has already acted on, and the diff against desired state.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tend_id::{Namespace, ObjectUid, ResourceName};
use tend_reconcile::{diff_sets, CancelHandle};
use tracing::debug;

use crate::store::EngineState;

/// Work a watcher must do to catch up with state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchTaskList {
    /// Every namespace a resource deploys into.
    pub watchable_namespaces: BTreeSet<Namespace>,
    /// Namespaces needing a watch.
    pub setup_namespaces: Vec<Namespace>,
    /// Namespaces whose watch is no longer needed.
    pub teardown_namespaces: Vec<Namespace>,
    /// Deployed UIDs not seen before, or now owned by a different resource.
    pub new_uids: BTreeMap<ObjectUid, ResourceName>,
    /// Previously deployed UIDs no resource owns any more.
    pub stale_uids: Vec<ObjectUid>,
}

impl WatchTaskList {
    pub fn is_empty(&self) -> bool {
        self.setup_namespaces.is_empty()
            && self.teardown_namespaces.is_empty()
            && self.new_uids.is_empty()
            && self.stale_uids.is_empty()
    }
}

/// Namespace watches and deployed UIDs a watcher currently acts on.
///
/// A namespace whose watch could not be set up is held in `retrying` with
/// the handle of its retry task. It counts as handled, so it is neither set
/// up again on every change nor reported twice.
#[derive(Debug, Default)]
pub struct WatcherKnownState {
    namespace_watches: BTreeMap<Namespace, CancelHandle>,
    retrying: BTreeMap<Namespace, CancelHandle>,
    known_deployed_uids: HashMap<ObjectUid, ResourceName>,
}

impl WatcherKnownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare state against what this watcher knows. Pure; nothing is
    /// applied until the caller does so.
    pub fn create_task_list(&self, state: &EngineState) -> WatchTaskList {
        let resolve = |ns: &Namespace| {
            if ns.is_empty() {
                state.default_namespace.clone()
            } else {
                ns.clone()
            }
        };

        let mut watchable = BTreeSet::new();
        let mut seen_uids: BTreeMap<ObjectUid, ResourceName> = BTreeMap::new();

        for (mt, runtime) in state.k8s_targets() {
            if let Some(target) = mt.manifest.k8s_target() {
                watchable.extend(target.namespaces.iter().map(&resolve));
            }

            for deployed in &runtime.deployed_refs {
                watchable.insert(resolve(&deployed.namespace));
                seen_uids.insert(deployed.uid.clone(), mt.manifest.name.clone());
            }
        }

        let active: BTreeSet<Namespace> = self
            .namespace_watches
            .keys()
            .chain(self.retrying.keys())
            .cloned()
            .collect();
        let namespaces = diff_sets(&watchable, &active);

        let new_uids = seen_uids
            .iter()
            .filter(|(uid, name)| self.known_deployed_uids.get(*uid) != Some(*name))
            .map(|(uid, name)| (uid.clone(), name.clone()))
            .collect();

        let mut stale_uids: Vec<ObjectUid> = self
            .known_deployed_uids
            .keys()
            .filter(|uid| !seen_uids.contains_key(*uid))
            .cloned()
            .collect();
        stale_uids.sort();

        WatchTaskList {
            watchable_namespaces: watchable,
            setup_namespaces: namespaces.to_setup,
            teardown_namespaces: namespaces.to_teardown,
            new_uids,
            stale_uids,
        }
    }

    pub fn watched_namespaces(&self) -> Vec<Namespace> {
        self.namespace_watches.keys().cloned().collect()
    }

    pub fn is_watching(&self, namespace: &Namespace) -> bool {
        self.namespace_watches.contains_key(namespace)
    }

    pub fn register_watch(&mut self, namespace: Namespace, handle: CancelHandle) {
        debug!(namespace = %namespace, "Watch registered");
        if let Some(previous) = self.namespace_watches.insert(namespace, handle) {
            previous.cancel();
        }
    }

    /// Record a namespace whose watch failed to start. `handle` cancels
    /// the task retrying it.
    pub fn register_retry(&mut self, namespace: Namespace, handle: CancelHandle) {
        debug!(namespace = %namespace, "Watch setup will be retried");
        if let Some(previous) = self.retrying.insert(namespace, handle) {
            previous.cancel();
        }
    }

    /// Move a retried namespace to the watched set once its watch is up.
    /// Returns false if the namespace was torn down in the meantime.
    pub fn promote_retry(&mut self, namespace: &Namespace) -> bool {
        match self.retrying.remove(namespace) {
            Some(handle) => {
                self.register_watch(namespace.clone(), handle);
                true
            }
            None => false,
        }
    }

    pub fn is_retrying(&self, namespace: &Namespace) -> bool {
        self.retrying.contains_key(namespace)
    }

    /// Cancel and forget a namespace watch or its pending retry.
    pub fn teardown_namespace(&mut self, namespace: &Namespace) {
        if let Some(handle) = self.namespace_watches.remove(namespace) {
            handle.cancel();
        }
        if let Some(handle) = self.retrying.remove(namespace) {
            handle.cancel();
        }
    }

    pub fn teardown_all(&mut self) {
        let watches = std::mem::take(&mut self.namespace_watches);
        let retries = std::mem::take(&mut self.retrying);
        for (_, handle) in watches.into_iter().chain(retries) {
            handle.cancel();
        }
        self.known_deployed_uids.clear();
    }

    pub fn record_uid(&mut self, uid: ObjectUid, resource: ResourceName) {
        self.known_deployed_uids.insert(uid, resource);
    }

    pub fn forget_uid(&mut self, uid: &ObjectUid) {
        self.known_deployed_uids.remove(uid);
    }

    pub fn known_deployed_uids(&self) -> &HashMap<ObjectUid, ResourceName> {
        &self.known_deployed_uids
    }
}
