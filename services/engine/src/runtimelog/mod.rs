//! Container log streaming.
//!
//! One stream per running (or freshly terminated) container of every
//! tracked pod. Streams are restarted when they go quiet for longer than the
//! health-check interval, resuming just after the last read.

mod controller;
mod lines;

pub use controller::{PodLogStreamController, StreamName};
pub use lines::LineBuffer;
