//! Cluster watchers.
//!
//! Both watchers follow the same cycle on every state change: diff desired
//! namespaces and deployed UIDs against what they know, set up and tear
//! down namespace watches, and replay remembered objects under any newly
//! deployed UID.

mod event_watch;
mod index;
mod known_state;
mod pod_watch;
mod triage;

pub use event_watch::EventWatchManager;
pub use index::DescendantIndex;
pub use known_state::{WatchTaskList, WatcherKnownState};
pub use pod_watch::PodWatcher;
pub use triage::{triage, ExtraSelector, MatchStrategy, TriageInput, TriageMatch};
