//! Reconciliation core of a local development orchestrator.
//!
//! The engine keeps a declared set of resources in sync with a cluster:
//!
//! - **Store**: single-writer state, changed only by dispatched actions
//! - **Watchers**: decide which namespaces to watch and attribute pods and
//!   events to resources through their owner chains
//! - **Reducers**: per-resource pod tracking, restart and crash detection
//! - **Streams**: container log tailing and port forwarding, reconnected
//!   with backoff
//!
//! The cluster, owner lookups and status persistence are collaborators
//! behind traits; in-memory fakes ship with the crate.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod k8s;
pub mod logging;
pub mod model;
pub mod portforward;
pub mod runtimelog;
pub mod status;
pub mod store;
pub mod watch;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ClientError, EngineError};
pub use model::{DeployTarget, K8sTarget, LogFilter, Manifest, PortForward};
pub use status::{RecordingStatusSink, StatusSink};
