//! Engine facade: one store and the subscribers that keep it in sync with
//! the cluster.

use std::sync::Arc;

use chrono::Utc;
use tend_reconcile::{CancelHandle, CancelSignal};
use tokio::sync::watch;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::k8s::{ClusterClient, OwnerFetcher};
use crate::portforward::PortForwardController;
use crate::runtimelog::PodLogStreamController;
use crate::status::StatusSink;
use crate::store::{EngineState, Store};
use crate::watch::{EventWatchManager, PodWatcher};

/// The reconciliation engine.
///
/// Collaborators feed it actions through [`Engine::store`]; everything it
/// learns from the cluster comes back as state and log entries in the same
/// store.
pub struct Engine {
    store: Arc<Store>,
    cancel: CancelHandle,
}

impl Engine {
    pub async fn new(
        config: &EngineConfig,
        client: Arc<dyn ClusterClient>,
        owner_fetcher: Arc<dyn OwnerFetcher>,
        status_sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self::with_clock(config, client, owner_fetcher, status_sink, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        config: &EngineConfig,
        client: Arc<dyn ClusterClient>,
        owner_fetcher: Arc<dyn OwnerFetcher>,
        status_sink: Arc<dyn StatusSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = EngineState::new(
            clock.now(),
            config.default_namespace.clone(),
            config.log_store_max_entries,
        );
        let store = Store::new(state);
        let (cancel, signal) = CancelSignal::detached();

        let pod_watcher = PodWatcher::new(
            Arc::clone(&client),
            Arc::clone(&owner_fetcher),
            signal.clone(),
        );
        let event_watcher =
            EventWatchManager::new(Arc::clone(&client), owner_fetcher, signal.clone());
        let log_streams = PodLogStreamController::new(
            Arc::clone(&client),
            Arc::clone(&status_sink),
            Arc::clone(&clock),
            signal.clone(),
            config,
        );
        let port_forwards = PortForwardController::new(
            client,
            status_sink,
            clock,
            signal,
            config.port_forward_backoff.clone(),
        );

        store.add_subscriber(Arc::new(pod_watcher)).await;
        store.add_subscriber(Arc::new(event_watcher)).await;
        store.add_subscriber(Arc::new(log_streams)).await;
        store.add_subscriber(Arc::new(port_forwards)).await;

        Self { store, cancel }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run until `shutdown` flips to true, then stop every watch, stream
    /// and forward.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(started_at = %Utc::now(), "Engine running");
        Arc::clone(&self.store)
            .run(CancelSignal::root(shutdown))
            .await;
        self.cancel.cancel();
        info!("Engine stopped");
    }
}
