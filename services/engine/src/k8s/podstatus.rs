//! Human-readable pod status, matching the STATUS column of
//! `kubectl get pods`.

use super::object::{ContainerState, ContainerStatus, Pod};

/// Waiting reasons whose message carries useful diagnostics.
const ERROR_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "RunContainerError",
    "StartError",
    "Error",
];

/// Returns true while at least one init container has not finished cleanly.
pub fn is_pod_still_initializing(pod: &Pod) -> bool {
    pod.init_container_statuses
        .iter()
        .any(|c| !matches!(&c.state, ContainerState::Terminated(t) if t.exit_code == 0))
}

/// Summarize a pod's status in one word (or `Init:` prefixed word).
pub fn pod_status_to_string(pod: &Pod) -> String {
    let mut reason = if pod.reason.is_empty() {
        pod.phase.to_string()
    } else {
        pod.reason.clone()
    };

    for (i, container) in pod.init_container_statuses.iter().enumerate() {
        match &container.state {
            ContainerState::Terminated(t) if t.exit_code == 0 => continue,
            ContainerState::Terminated(t) => {
                reason = if !t.reason.is_empty() {
                    format!("Init:{}", t.reason)
                } else if t.signal != 0 {
                    format!("Init:Signal:{}", t.signal)
                } else {
                    format!("Init:ExitCode:{}", t.exit_code)
                };
            }
            ContainerState::Waiting { reason: waiting, .. }
                if !waiting.is_empty() && waiting != "PodInitializing" =>
            {
                reason = format!("Init:{waiting}");
            }
            _ => {
                reason = format!("Init:{}/{}", i, pod.init_containers.len());
            }
        }
        break;
    }

    if is_pod_still_initializing(pod) {
        return reason;
    }

    // The first container wins, so walk back to front.
    for container in pod.container_statuses.iter().rev() {
        match &container.state {
            ContainerState::Waiting { reason: waiting, .. } if !waiting.is_empty() => {
                reason = waiting.clone();
            }
            ContainerState::Terminated(t) if !t.reason.is_empty() => {
                reason = t.reason.clone();
            }
            ContainerState::Terminated(t) if t.signal != 0 => {
                reason = format!("Signal:{}", t.signal);
            }
            ContainerState::Terminated(t) => {
                reason = format!("ExitCode:{}", t.exit_code);
            }
            _ => {}
        }
    }

    reason
}

/// Pull interesting error messages out of a pod's container statuses.
pub fn pod_status_error_messages(pod: &Pod) -> Vec<String> {
    let mut result = Vec::new();

    if is_pod_still_initializing(pod) {
        for container in &pod.init_container_statuses {
            result.extend(container_error_messages(container));
        }
    }

    for container in pod.container_statuses.iter().rev() {
        result.extend(container_error_messages(container));
    }

    result
}

fn container_error_messages(container: &ContainerStatus) -> Vec<String> {
    let mut result = Vec::new();

    match &container.state {
        ContainerState::Waiting { reason, message } => {
            if let Some(last) = &container.last_termination {
                if last.exit_code != 0 && !last.message.is_empty() {
                    result.push(last.message.clone());
                }
            }

            // Error modes often say when the pod will be retried.
            if !message.is_empty() && ERROR_WAITING_REASONS.contains(&reason.as_str()) {
                result.push(message.clone());
            }
        }
        ContainerState::Terminated(t) if t.exit_code != 0 && !t.message.is_empty() => {
            result.push(t.message.clone());
        }
        _ => {}
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::object::{ContainerSpec, PodPhase, TerminatedState};
    use rstest::rstest;
    use tend_id::{ContainerName, Namespace, ObjectUid};

    fn pod() -> Pod {
        Pod::new("web-1", Namespace::new("default"), ObjectUid::new("u1"))
            .with_phase(PodPhase::Running)
    }

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: ContainerName::new(name),
            ..ContainerSpec::default()
        }
    }

    fn status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: ContainerName::new(name),
            state,
            ..ContainerStatus::default()
        }
    }

    fn waiting(reason: &str, message: &str) -> ContainerState {
        ContainerState::Waiting {
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    fn terminated(exit_code: i32, reason: &str) -> ContainerState {
        ContainerState::Terminated(TerminatedState {
            exit_code,
            reason: reason.to_string(),
            ..TerminatedState::default()
        })
    }

    #[test]
    fn test_running_pod() {
        let p = pod().with_container(
            spec("app"),
            status("app", ContainerState::Running { started_at: None }),
        );
        assert_eq!(pod_status_to_string(&p), "Running");
    }

    #[test]
    fn test_pod_reason_overrides_phase() {
        let mut p = pod();
        p.reason = "Evicted".to_string();
        assert_eq!(pod_status_to_string(&p), "Evicted");
    }

    #[rstest]
    #[case(waiting("CrashLoopBackOff", ""), "CrashLoopBackOff")]
    #[case(terminated(1, "Error"), "Error")]
    #[case(terminated(137, ""), "ExitCode:137")]
    #[case(terminated(0, "Completed"), "Completed")]
    fn test_container_states(#[case] state: ContainerState, #[case] expected: &str) {
        let p = pod().with_container(spec("app"), status("app", state));
        assert_eq!(pod_status_to_string(&p), expected);
    }

    #[test]
    fn test_first_container_wins() {
        let p = pod()
            .with_container(spec("a"), status("a", waiting("ErrImagePull", "")))
            .with_container(spec("b"), status("b", waiting("CrashLoopBackOff", "")));
        assert_eq!(pod_status_to_string(&p), "ErrImagePull");
    }

    #[test]
    fn test_init_container_progress() {
        let p = pod()
            .with_phase(PodPhase::Pending)
            .with_init_container(spec("init-a"), status("init-a", terminated(0, "")))
            .with_init_container(spec("init-b"), status("init-b", waiting("PodInitializing", "")))
            .with_container(spec("app"), status("app", waiting("PodInitializing", "")));

        assert!(is_pod_still_initializing(&p));
        assert_eq!(pod_status_to_string(&p), "Init:1/2");
    }

    #[test]
    fn test_init_container_failure() {
        let p = pod()
            .with_init_container(spec("init"), status("init", terminated(2, "")))
            .with_container(spec("app"), status("app", waiting("PodInitializing", "")));
        assert_eq!(pod_status_to_string(&p), "Init:ExitCode:2");
    }

    #[test]
    fn test_error_messages() {
        let mut crashed = status("app", waiting("CrashLoopBackOff", "back-off 10s restarting"));
        crashed.last_termination = Some(TerminatedState {
            exit_code: 1,
            message: "panic: boom".to_string(),
            ..TerminatedState::default()
        });

        let p = pod().with_container(spec("app"), crashed);
        assert_eq!(
            pod_status_error_messages(&p),
            vec!["panic: boom".to_string(), "back-off 10s restarting".to_string()]
        );
    }

    #[test]
    fn test_waiting_message_ignored_for_benign_reasons() {
        let p = pod().with_container(
            spec("app"),
            status("app", waiting("ContainerCreating", "pulling image")),
        );
        assert!(pod_status_error_messages(&p).is_empty());
    }
}
