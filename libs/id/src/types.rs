//! Typed identifier definitions.
//!
//! Every identifier is an opaque string. Types exist only so that the
//! different coordinate systems (logical resources, cluster objects, log
//! spans) cannot be confused with each other.

use crate::define_name;

// =============================================================================
// Logical Resources
// =============================================================================

define_name!(ResourceName, "resource name");

// =============================================================================
// Cluster Objects
// =============================================================================

define_name!(ObjectUid, "object uid");
define_name!(PodId, "pod id");
define_name!(Namespace, "namespace");
define_name!(ContainerName, "container name");
define_name!(ContainerId, "container id");

// =============================================================================
// Log Correlation
// =============================================================================

define_name!(SpanId, "span id");

impl SpanId {
    /// Span for output produced by (or about) a pod.
    pub fn for_pod(pod_id: &PodId) -> Self {
        Self::new(format!("pod:{pod_id}"))
    }

    /// Span for build-level notices about a resource.
    pub fn for_build(resource: &ResourceName) -> Self {
        Self::new(format!("build:{resource}"))
    }
}
