//! Status reporting for streams and forwards.
//!
//! Controllers keep their status in memory and mirror it to a
//! [`StatusSink`] only when it changes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tend_id::{ContainerName, Namespace, PodId, ResourceName};

use crate::error::EngineError;

/// Log streaming status of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerLogStreamStatus {
    pub name: ContainerName,
    /// A stream is open and reading.
    pub active: bool,
    /// The container terminated and its output has been read to the end.
    pub terminated: bool,
    pub error: Option<String>,
}

/// Log streaming status of one pod, per container in stream order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PodLogStreamStatus {
    pub containers: Vec<ContainerLogStreamStatus>,
}

impl PodLogStreamStatus {
    pub fn container(&self, name: &ContainerName) -> Option<&ContainerLogStreamStatus> {
        self.containers.iter().find(|c| &c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ForwardState {
    Connecting,
    Active,
    Error(String),
}

/// Status of one local-to-pod port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardStatus {
    pub local_port: u16,
    pub container_port: u16,
    pub host: String,
    pub state: ForwardState,
    /// When the current session started, if one is up.
    pub started_at: Option<DateTime<Utc>>,
}

/// Port-forward status of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortForwardStatus {
    pub namespace: Namespace,
    pub forwards: Vec<ForwardStatus>,
}

/// Receives status changes.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update_log_stream_status(
        &self,
        resource: &ResourceName,
        pod: &PodId,
        status: &PodLogStreamStatus,
    ) -> Result<(), EngineError>;

    async fn update_port_forward_status(
        &self,
        resource: &ResourceName,
        pod: &PodId,
        status: &PortForwardStatus,
    ) -> Result<(), EngineError>;
}

/// Last reported status per key.
#[derive(Debug)]
pub struct ReportedStatuses<K, S> {
    reported: HashMap<K, S>,
}

impl<K: Eq + Hash, S: PartialEq> ReportedStatuses<K, S> {
    pub fn new() -> Self {
        Self {
            reported: HashMap::new(),
        }
    }

    /// Check if status needs to be reported (transition detection).
    pub fn needs_report(&self, key: &K, status: &S) -> bool {
        self.reported.get(key) != Some(status)
    }

    /// Mark current status as reported.
    pub fn mark_reported(&mut self, key: K, status: S) {
        self.reported.insert(key, status);
    }

    pub fn forget(&mut self, key: &K) {
        self.reported.remove(key);
    }
}

impl<K: Eq + Hash, S: PartialEq> Default for ReportedStatuses<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

type LogUpdate = (ResourceName, PodId, PodLogStreamStatus);
type ForwardUpdate = (ResourceName, PodId, PortForwardStatus);

/// Sink that records every update, for tests.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    log_updates: Mutex<Vec<LogUpdate>>,
    forward_updates: Mutex<Vec<ForwardUpdate>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_updates(&self) -> Vec<LogUpdate> {
        self.log_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn forward_updates(&self) -> Vec<ForwardUpdate> {
        self.forward_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn latest_log_status(
        &self,
        resource: &ResourceName,
        pod: &PodId,
    ) -> Option<PodLogStreamStatus> {
        self.log_updates()
            .into_iter()
            .rev()
            .find(|(r, p, _)| r == resource && p == pod)
            .map(|(_, _, status)| status)
    }

    pub fn latest_forward_status(
        &self,
        resource: &ResourceName,
        pod: &PodId,
    ) -> Option<PortForwardStatus> {
        self.forward_updates()
            .into_iter()
            .rev()
            .find(|(r, p, _)| r == resource && p == pod)
            .map(|(_, _, status)| status)
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn update_log_stream_status(
        &self,
        resource: &ResourceName,
        pod: &PodId,
        status: &PodLogStreamStatus,
    ) -> Result<(), EngineError> {
        self.log_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((resource.clone(), pod.clone(), status.clone()));
        Ok(())
    }

    async fn update_port_forward_status(
        &self,
        resource: &ResourceName,
        pod: &PodId,
        status: &PortForwardStatus,
    ) -> Result<(), EngineError> {
        self.forward_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((resource.clone(), pod.clone(), status.clone()));
        Ok(())
    }
}
