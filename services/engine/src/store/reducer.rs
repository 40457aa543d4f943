//! Applies actions to state.

use tend_id::{PodId, SpanId};
use tracing::{debug, trace};

use super::action::{Action, K8sDeployedAction, K8sEventAction, LiveUpdateAction, LogAction};
use super::log_store::LogLevel;
use super::pods::{handle_pod_change, handle_pod_delete, handle_pod_reset_restarts};
use super::state::{EngineState, PodAncestor};
use crate::k8s::EventType;

/// Apply one action. Reducers never fail; actions that no longer make
/// sense (for example, about a removed resource) are ignored.
pub fn reduce(state: &mut EngineState, action: Action) {
    trace!(action = action.name(), "Reducing action");

    match action {
        Action::ManifestUpsert(manifest) => state.upsert_manifest(manifest),
        Action::ManifestRemove(name) => {
            state.remove_manifest(&name);
        }
        Action::K8sDeployed(action) => handle_k8s_deployed(state, action),
        Action::LiveUpdated(action) => handle_live_updated(state, action),
        Action::PodChange(action) => handle_pod_change(state, action),
        Action::PodDelete(action) => handle_pod_delete(state, action),
        Action::PodResetRestarts(action) => handle_pod_reset_restarts(state, action),
        Action::K8sEvent(action) => handle_k8s_event(state, action),
        Action::Log(action) => state.log_store.append(action.into_entry()),
        Action::Error(action) => {
            let entry = LogAction::new(
                None,
                SpanId::new("engine"),
                LogLevel::Error,
                format!("{}\n", action.message),
            );
            state.log_store.append(entry.into_entry());
            state.record_error(action.message);
        }
    }
}

fn handle_k8s_deployed(state: &mut EngineState, action: K8sDeployedAction) {
    let Some(runtime) = state
        .manifest_target_mut(&action.resource)
        .and_then(|mt| mt.state.k8s_runtime_mut())
    else {
        return;
    };

    runtime.deployed_refs = action.refs;
    runtime.pod_template_hashes = action.pod_template_hashes;
    runtime.last_deploy_time = Some(action.at);

    // Pods of an object this deploy no longer owns are stale.
    if let PodAncestor::Owner(uid) = &runtime.pod_ancestor {
        if !runtime.has_deployed_uid(uid) {
            debug!(
                resource = %action.resource,
                ancestor = %uid,
                "Dropping pods of replaced ancestor"
            );
            runtime.pods.clear();
            runtime.pod_ancestor = PodAncestor::Unknown;
        }
    }
}

fn handle_live_updated(state: &mut EngineState, action: LiveUpdateAction) {
    let Some(mt) = state.manifest_target_mut(&action.resource) else {
        return;
    };

    mt.state.live_updated_container_ids = action.container_ids;
    mt.state.needs_rebuild_from_crash = false;
    mt.state.last_build_span = Some(action.span_id);
}

fn handle_k8s_event(state: &mut EngineState, action: K8sEventAction) {
    if state.manifest_target(&action.resource).is_none() {
        return;
    }

    let event = &action.event;
    let level = match event.event_type {
        EventType::Warning => LogLevel::Warn,
        EventType::Normal => LogLevel::Info,
    };

    let involved = &event.involved_object;
    let span_id = if involved.kind == "Pod" {
        SpanId::for_pod(&PodId::new(involved.name.clone()))
    } else {
        SpanId::for_build(&action.resource)
    };

    let text = format!(
        "[event: {} {}] {}\n",
        involved.kind.to_lowercase(),
        involved.name,
        event.message.trim()
    );

    state
        .log_store
        .append(LogAction::new(Some(action.resource), span_id, level, text).into_entry());
}
