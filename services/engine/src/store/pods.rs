//! Reducers for pod lifecycle actions.
//!
//! Attribution of a pod to a resource happens in the watchers; by the time
//! an action lands here the resource is known. These reducers decide whether
//! the pod belongs to the current deploy, keep its status current, and turn
//! restarts and crashes into user-facing notices.

use tend_id::ContainerName;
use tracing::{debug, warn};

use super::action::{LogAction, PodChangeAction, PodDeleteAction, PodResetRestartsAction};
use super::state::{Container, EngineState, K8sRuntimeState, ManifestState, PodAncestor, TrackedPod};
use crate::k8s::{
    pod_status_error_messages, pod_status_to_string, ContainerSpec, ContainerState,
    ContainerStatus, PodPhase,
};
use crate::portforward::port_forwards_are_valid;

pub(crate) fn handle_pod_change(state: &mut EngineState, action: PodChangeAction) {
    let Some(mt) = state.manifest_target_mut(&action.resource) else {
        // The manifest may have been edited away while the change was in flight.
        return;
    };

    let mut notices = Vec::new();
    let resource = mt.manifest.name.clone();
    let port_forwards = mt
        .manifest
        .k8s_target()
        .map(|t| t.port_forwards.clone())
        .unwrap_or_default();

    let Some(runtime) = mt.state.k8s_runtime_mut() else {
        return;
    };

    if let Some(ancestor) = &action.matched_ancestor {
        if !runtime.has_deployed_uid(ancestor) {
            debug!(
                pod = %action.pod.meta.name,
                ancestor = %ancestor,
                "Ignoring pod from a previous deploy"
            );
            return;
        }
    }

    let pod = &action.pod;
    let pod_id = pod.pod_id();
    let Some(is_new) = maybe_track_pod(runtime, &action) else {
        // A pod from an old deploy that was never tracked.
        return;
    };
    let Some(tracked) = runtime.pods.get_mut(&pod_id) else {
        return;
    };

    tracked.created_at = pod.meta.creation_timestamp;
    tracked.status = pod_status_to_string(pod);
    tracked.status_messages = pod_status_error_messages(pod);
    tracked.namespace = pod.meta.namespace.clone();
    tracked.uid = pod.meta.uid.clone();
    tracked.deleting = pod.is_deleting();
    tracked.phase = pod.phase;

    let init_containers = pod_containers(&pod.init_containers, &pod.init_container_statuses);
    let containers = pod_containers(&pod.containers, &pod.container_statuses);
    if !is_new {
        let restarted = restarted_container_names(&tracked.init_containers, &init_containers)
            .into_iter()
            .chain(restarted_container_names(&tracked.containers, &containers));
        for name in restarted {
            notices.push(LogAction::warn(
                &resource,
                tracked.span_id.clone(),
                format!("Detected container restart. Pod: {pod_id}. Container: {name}.\n"),
            ));
        }
    }
    tracked.init_containers = init_containers;
    tracked.containers = containers;

    if is_new {
        // Restarts that happened before we attached are old history.
        tracked.baseline_restarts = tracked.all_container_restarts();
    }

    let has_containers = !tracked.containers.is_empty();
    let ready = tracked.all_containers_ready() || tracked.phase == PodPhase::Succeeded;
    let forwards_valid = port_forwards_are_valid(&port_forwards, tracked);

    prune_pods(runtime);

    if has_containers {
        if ready {
            runtime.last_ready_or_succeeded_time = Some(action.observed_at);
        }

        if !forwards_valid {
            warn!(
                resource = %resource,
                pod = %pod_id,
                "Resource is using port forwards, but no container ports on pod"
            );
        }

        notices.extend(check_for_container_crash(&mut mt.state));
    }

    for notice in notices {
        state.log_store.append(notice.into_entry());
    }
}

/// Start tracking a pod if it belongs to the current deploy.
///
/// Returns `None` if the pod should be ignored, otherwise whether it was
/// newly tracked. A match on a different ancestor than the one currently
/// tracked replaces every tracked pod.
fn maybe_track_pod(runtime: &mut K8sRuntimeState, action: &PodChangeAction) -> Option<bool> {
    let pod_id = action.pod.pod_id();

    if !runtime.has_ok_pod_template_hash(&action.pod) {
        // Old deploys stay visible only if we were already tracking them.
        return runtime.pods.contains_key(&pod_id).then_some(false);
    }

    let replace = match (&runtime.pod_ancestor, &action.matched_ancestor) {
        (PodAncestor::Unknown, _) => true,
        (PodAncestor::Selector, Some(_)) => true,
        (PodAncestor::Owner(current), Some(matched)) => current != matched,
        (_, None) => false,
    };

    if replace {
        runtime.pods.clear();
        runtime.pod_ancestor = match &action.matched_ancestor {
            Some(uid) => PodAncestor::Owner(uid.clone()),
            None => PodAncestor::Selector,
        };
    }

    if runtime.pods.contains_key(&pod_id) {
        return Some(false);
    }

    runtime
        .pods
        .insert(pod_id, TrackedPod::new(&action.pod));
    Some(true)
}

/// Convert observed statuses into tracked containers, in status order.
pub(crate) fn pod_containers(
    specs: &[ContainerSpec],
    statuses: &[ContainerStatus],
) -> Vec<Container> {
    statuses
        .iter()
        .map(|status| {
            let spec = specs.iter().find(|s| s.name == status.name);
            let terminated_at = match (&status.state, &status.last_termination) {
                (ContainerState::Terminated(t), _) => t.finished_at,
                (_, Some(last)) => last.finished_at,
                _ => None,
            };

            Container {
                name: status.name.clone(),
                id: status.id(),
                image: status.image.clone(),
                ports: spec.map(|s| s.ports.clone()).unwrap_or_default(),
                ready: status.ready,
                running: status.is_running(),
                terminated: status.is_terminated(),
                restarts: status.restart_count,
                terminated_at,
            }
        })
        .collect()
}

/// Names of containers whose restart count went up.
///
/// Containers are compared by position; a position whose name changed is
/// not a restart.
pub(crate) fn restarted_container_names(
    existing: &[Container],
    updated: &[Container],
) -> Vec<ContainerName> {
    existing
        .iter()
        .zip(updated)
        .filter(|(old, new)| old.name == new.name && new.restarts > old.restarts)
        .map(|(_, new)| new.name.clone())
        .collect()
}

/// Drop pods that only clutter the view.
///
/// Deleting pods always go. Then, while more than one pod is tracked,
/// terminated pods other than the most recent are removed.
pub(crate) fn prune_pods(runtime: &mut K8sRuntimeState) {
    runtime.pods.retain(|_, pod| !pod.deleting);

    while runtime.pods.len() > 1 {
        let Some(best) = runtime.most_recent_pod().map(|p| p.pod_id.clone()) else {
            break;
        };

        let victim = runtime
            .pods
            .values()
            .find(|p| p.is_terminated() && p.pod_id != best)
            .map(|p| p.pod_id.clone());

        match victim {
            Some(pod_id) => {
                runtime.pods.remove(&pod_id);
            }
            None => break,
        }
    }
}

/// Flag a rebuild when a live-updated container is no longer running.
///
/// Live updates only live in the container they were synced into; once it
/// is replaced the resource may be running stale code.
pub(crate) fn check_for_container_crash(ms: &mut ManifestState) -> Option<LogAction> {
    if ms.needs_rebuild_from_crash {
        return None;
    }

    let running = ms.runtime.running_container_ids();
    let lost = ms
        .live_updated_container_ids
        .iter()
        .any(|id| !running.contains(id));
    if !lost {
        return None;
    }

    ms.needs_rebuild_from_crash = true;
    ms.live_updated_container_ids.clear();

    Some(LogAction::warn(
        &ms.name,
        ms.build_span(),
        format!(
            "Detected a container change for {}. We could be running stale code. \
             Rebuilding and deploying a new image.\n",
            ms.name
        ),
    ))
}

pub(crate) fn handle_pod_delete(state: &mut EngineState, action: PodDeleteAction) {
    // Deletes carry no ancestry, so check every resource.
    for mt in state.manifest_targets.values_mut() {
        let Some(runtime) = mt.state.k8s_runtime_mut() else {
            continue;
        };

        let same_namespace = runtime
            .pods
            .get(&action.pod_id)
            .is_some_and(|p| p.namespace.is_empty() || p.namespace == action.namespace);
        if same_namespace {
            runtime.pods.remove(&action.pod_id);
        }
    }
}

pub(crate) fn handle_pod_reset_restarts(state: &mut EngineState, action: PodResetRestartsAction) {
    let Some(tracked) = state
        .manifest_target_mut(&action.resource)
        .and_then(|mt| mt.state.k8s_runtime_mut())
        .and_then(|runtime| runtime.pods.get_mut(&action.pod_id))
    else {
        return;
    };

    // The pod may have restarted again since the user looked at it; keep
    // those newer restarts visible.
    let delta = tracked
        .visible_container_restarts()
        .saturating_sub(action.visible_restarts);
    tracked.baseline_restarts = tracked.all_container_restarts().saturating_sub(delta);
}
