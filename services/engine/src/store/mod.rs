//! State store, actions and reducers.

mod action;
mod bus;
mod log_store;
mod pods;
mod reducer;
mod state;

pub use action::{
    Action, ErrorAction, K8sDeployedAction, K8sEventAction, LiveUpdateAction, LogAction,
    PodChangeAction, PodDeleteAction, PodResetRestartsAction,
};
pub use bus::{Store, Subscriber};
pub use log_store::{LogEntry, LogLevel, LogStore};
pub use reducer::reduce;
pub use state::{
    Container, DeployedRef, DockerComposeRuntimeState, EngineState, K8sRuntimeState,
    LocalRuntimeState, ManifestState, ManifestTarget, PodAncestor, RuntimeState, TrackedPod,
    POD_TEMPLATE_HASH_LABEL,
};
