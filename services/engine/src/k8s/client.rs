//! Cluster client interface.
//!
//! The engine talks to the cluster only through these traits. A fake
//! implementation lives in [`fake`](super::fake).

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use tend_id::{ContainerName, Namespace, PodId};
use tokio::io::AsyncRead;

use super::object::{K8sEvent, PodUpdate};
use crate::error::ClientError;

/// Stream of pod changes in one namespace.
pub type PodWatchStream = Pin<Box<dyn Stream<Item = PodUpdate> + Send>>;

/// Stream of events in one namespace.
pub type EventWatchStream = Pin<Box<dyn Stream<Item = K8sEvent> + Send>>;

/// Raw bytes of a container's log.
pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// Parameters of one port-forward session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortForwardRequest {
    pub namespace: Namespace,
    pub pod: PodId,
    pub local_port: u16,
    pub container_port: u16,
    pub host: String,
}

/// Kubernetes API access.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Watch pods in a namespace. The stream ends when the watch is closed
    /// by the server.
    async fn watch_pods(&self, namespace: &Namespace) -> Result<PodWatchStream, ClientError>;

    /// Watch events in a namespace.
    async fn watch_events(&self, namespace: &Namespace) -> Result<EventWatchStream, ClientError>;

    /// Follow a container's log, starting at `since` when given.
    async fn container_logs(
        &self,
        pod: &PodId,
        container: &ContainerName,
        namespace: &Namespace,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogReader, ClientError>;

    /// Prepare a port-forward session. Nothing is bound until
    /// [`PortForwarder::forward_ports`] is called.
    async fn create_port_forwarder(
        &self,
        request: &PortForwardRequest,
    ) -> Result<Box<dyn PortForwarder>, ClientError>;
}

/// A single port-forward session.
#[async_trait]
pub trait PortForwarder: Send {
    /// Forward until the session breaks. Only returns on failure or when
    /// the connection is torn down.
    async fn forward_ports(&mut self) -> Result<(), ClientError>;
}
