//! Cluster-facing types and collaborator interfaces.

pub mod client;
pub mod fake;
pub mod labels;
pub mod object;
pub mod owner;
pub mod podstatus;

pub use client::{
    ClusterClient, EventWatchStream, LogReader, PodWatchStream, PortForwardRequest, PortForwarder,
};
pub use fake::{FakeClusterClient, FakeForward, FakeLogs, FakeOwnerFetcher, LogCall, LogEnding};
pub use labels::{LabelRequirement, LabelSelector, SelectorOperator};
pub use object::{
    ContainerSpec, ContainerState, ContainerStatus, EventType, K8sEvent, ObjectMeta, ObjectRef,
    Pod, PodPhase, PodUpdate, TerminatedState,
};
pub use owner::{ObjectRefTree, OwnerFetcher};
pub use podstatus::{is_pod_still_initializing, pod_status_error_messages, pod_status_to_string};
