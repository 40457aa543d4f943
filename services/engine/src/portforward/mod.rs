//! Port forwarding to the most recent running pod of each resource.

mod controller;
mod resolve;

pub use controller::{ForwardKey, PortForwardController};
pub use resolve::{populate_port_forwards, port_forwards_are_valid, ResolvedForward};
