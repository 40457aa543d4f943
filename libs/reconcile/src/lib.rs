//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge running work to a desired set. Key concepts:
//!
//! - **Desired set**: What should be running, recomputed from scratch on
//!   every pass.
//! - **Active set**: What is running right now, owned by one controller.
//! - **Diff**: The start/stop/restart actions that close the gap.
//!
//! # Invariants
//!
//! - Diffs are pure functions of their inputs
//! - Re-running a diff against its own applied result yields no actions
//! - Every spawned unit of work is cancellable, and cancellation of a parent
//!   cancels all of its children

mod backoff;
mod cancel;
mod diff;

pub use backoff::{Backoff, BackoffPolicy};
pub use cancel::{CancelHandle, CancelSignal};
pub use diff::{diff_keyed, diff_sets, KeyedDiff, SetDiff};
