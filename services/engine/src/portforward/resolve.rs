//! Resolving declared port forwards against a pod's container ports.

use serde::Serialize;

use crate::model::PortForward;
use crate::store::TrackedPod;

/// A port forward with its container port decided.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResolvedForward {
    pub local_port: u16,
    pub container_port: u16,
    pub host: String,
}

/// Fill in unset container ports from the pod.
///
/// An unset container port becomes the local port if the pod exposes it,
/// otherwise the pod's first port. Forwards that cannot be filled in are
/// dropped.
pub fn populate_port_forwards(forwards: &[PortForward], pod: &TrackedPod) -> Vec<ResolvedForward> {
    let ports = pod.all_container_ports();

    forwards
        .iter()
        .filter_map(|forward| {
            let container_port = match forward.container_port.filter(|p| *p != 0) {
                Some(port) => port,
                None if ports.contains(&forward.local_port) => forward.local_port,
                None => *ports.first()?,
            };

            Some(ResolvedForward {
                local_port: forward.local_port,
                container_port,
                host: forward.host.clone(),
            })
        })
        .collect()
}

/// Whether every declared forward can be resolved against the pod.
pub fn port_forwards_are_valid(forwards: &[PortForward], pod: &TrackedPod) -> bool {
    populate_port_forwards(forwards, pod).len() == forwards.len()
}
