//! The store: serialized state updates plus change notification.
//!
//! Components never mutate state directly. They [`dispatch`](Store::dispatch)
//! actions, which the store loop applies in order under the write lock, and
//! they react to changes through [`Subscriber::on_change`], reading state
//! under the shared lock.

use std::sync::Arc;

use async_trait::async_trait;
use tend_reconcile::CancelSignal;
use tokio::sync::{mpsc, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use super::action::Action;
use super::reducer::reduce;
use super::state::EngineState;
use crate::error::EngineError;

/// A component that reacts to state changes.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Called after every batch of actions. Implementations read state,
    /// diff it against what they own, and converge.
    async fn on_change(&self, store: &Arc<Store>) -> Result<(), EngineError>;

    /// Release everything the subscriber owns. Called once at shutdown.
    async fn teardown(&self) {}
}

/// Central state store.
pub struct Store {
    state: RwLock<EngineState>,
    tx: mpsc::UnboundedSender<Action>,
    rx: Mutex<mpsc::UnboundedReceiver<Action>>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl Store {
    pub fn new(state: EngineState) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: RwLock::new(state),
            tx,
            rx: Mutex::new(rx),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Shared view of the state. Hold it only as long as needed; the store
    /// loop cannot apply actions while any reader is active.
    pub async fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().await
    }

    /// Queue an action. Never blocks.
    pub fn dispatch(&self, action: Action) {
        if self.tx.send(action).is_err() {
            // Unreachable while the store is alive; it owns the receiver.
            warn!("Action dropped, store is shutting down");
        }
    }

    pub async fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        debug!(subscriber = subscriber.name(), "Adding subscriber");
        self.subscribers.write().await.push(subscriber);
    }

    /// Apply every queued action without notifying subscribers.
    ///
    /// Returns the number of actions applied.
    pub async fn apply_pending(&self) -> usize {
        let batch = {
            let mut rx = self.rx.lock().await;
            let mut batch = Vec::new();
            while let Ok(action) = rx.try_recv() {
                batch.push(action);
            }
            batch
        };
        self.apply(batch).await
    }

    async fn apply(&self, batch: Vec<Action>) -> usize {
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        let mut state = self.state.write().await;
        for action in batch {
            reduce(&mut state, action);
        }
        count
    }

    /// Run every subscriber's `on_change` and wait for all of them.
    ///
    /// Each subscriber runs in its own task, so a panic in one is logged and
    /// does not take down the loop or the other subscribers.
    pub async fn notify_subscribers(self: &Arc<Self>) {
        let subscribers = self.subscribers.read().await.clone();

        let handles: Vec<_> = subscribers
            .into_iter()
            .map(|subscriber| {
                let name = subscriber.name().to_string();
                let store = Arc::clone(self);
                let handle = tokio::spawn(async move { subscriber.on_change(&store).await });
                (name, handle)
            })
            .collect();

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscriber = %name, error = %e, "Subscriber failed to handle change");
                }
                Err(e) => {
                    error!(subscriber = %name, error = %e, "Subscriber panicked");
                }
            }
        }
    }

    /// Run the store loop until shutdown.
    ///
    /// Subscribers are notified once at startup and then after every batch.
    /// Actions dispatched while subscribers run are picked up by the next
    /// batch.
    pub async fn run(self: Arc<Self>, shutdown: CancelSignal) {
        info!("Store loop started");
        self.notify_subscribers().await;

        loop {
            let batch = {
                let mut rx = self.rx.lock().await;
                let first = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    action = rx.recv() => action,
                };

                let Some(first) = first else {
                    break;
                };

                let mut batch = vec![first];
                while let Ok(action) = rx.try_recv() {
                    batch.push(action);
                }
                batch
            };

            let applied = self.apply(batch).await;
            debug!(actions = applied, "Applied actions");

            self.notify_subscribers().await;
        }

        self.teardown().await;
        info!("Store loop stopped");
    }

    /// Tear down every subscriber.
    pub async fn teardown(&self) {
        let subscribers = self.subscribers.read().await.clone();
        for subscriber in subscribers {
            debug!(subscriber = subscriber.name(), "Tearing down subscriber");
            subscriber.teardown().await;
        }
    }
}
