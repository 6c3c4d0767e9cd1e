//! Discrete mutations accepted by the store, and the reducer that applies them.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use drydock_core::{
    BuildReason, BuildRecord, ComposeRuntimeState, CurrentBuild, EngineState, K8sRuntimeState, Manifest, ManifestTarget, Pod,
    PodId, RuntimeState, SecretSet,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Action {
    /// Manifest appeared in, or changed within, the desired set.
    ManifestUpsert(Manifest),
    ManifestRemove(String),
    BuildStarted { manifest: String, reason: BuildReason, start_time: DateTime<Utc> },
    BuildCompleted { manifest: String, record: BuildRecord },
    PodChange { manifest: String, pod: Pod },
    PodDelete { manifest: String, pod_id: PodId },
    ComposeEvent { manifest: String, container_id: Option<String>, status: String, time: DateTime<Utc> },
    PortForwardStatus { manifest: String, error: Option<String> },
    SetSecrets(SecretSet),
    SetPaused(bool),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ManifestUpsert(_) => "manifest_upsert",
            Action::ManifestRemove(_) => "manifest_remove",
            Action::BuildStarted { .. } => "build_started",
            Action::BuildCompleted { .. } => "build_completed",
            Action::PodChange { .. } => "pod_change",
            Action::PodDelete { .. } => "pod_delete",
            Action::ComposeEvent { .. } => "compose_event",
            Action::PortForwardStatus { .. } => "port_forward_status",
            Action::SetSecrets(_) => "set_secrets",
            Action::SetPaused(_) => "set_paused",
        }
    }

    fn manifest(&self) -> Option<&str> {
        match self {
            Action::BuildStarted { manifest, .. }
            | Action::BuildCompleted { manifest, .. }
            | Action::PodChange { manifest, .. }
            | Action::PodDelete { manifest, .. }
            | Action::ComposeEvent { manifest, .. }
            | Action::PortForwardStatus { manifest, .. } => Some(manifest),
            _ => None,
        }
    }
}

/// Apply one action. Actions addressed to an unknown manifest are dropped: watchers
/// can race with manifest removal.
pub fn reduce(state: &mut EngineState, action: Action) {
    if let Some(name) = action.manifest() {
        if state.manifest_target(name).is_none() {
            debug!(action = action.name(), manifest = %name, "action for unknown manifest ignored");
            return;
        }
    }

    match action {
        Action::ManifestUpsert(m) => state.upsert_manifest_target(ManifestTarget::new(m)),
        Action::ManifestRemove(name) => {
            state.remove_manifest_target(&name);
        }
        Action::SetSecrets(secrets) => state.secrets = secrets,
        Action::SetPaused(paused) => state.paused = paused,
        Action::BuildStarted { manifest, reason, start_time } => {
            if let Some(t) = state.manifest_target_mut(&manifest) {
                t.state.current_build = Some(CurrentBuild { reason, start_time });
            }
        }
        Action::BuildCompleted { manifest, record } => {
            if let Some(t) = state.manifest_target_mut(&manifest) {
                t.state.add_completed_build(record);
            }
        }
        Action::PodChange { manifest, pod } => {
            if let Some(t) = state.manifest_target_mut(&manifest) {
                match t.state.runtime_state.k8s_mut() {
                    Some(k8s) => {
                        k8s.pods.insert(pod.pod_id.clone(), pod);
                    }
                    None => t.state.runtime_state = RuntimeState::Kubernetes(K8sRuntimeState::with_pod(pod)),
                }
            }
        }
        Action::PodDelete { manifest, pod_id } => {
            if let Some(k8s) = state.manifest_target_mut(&manifest).and_then(|t| t.state.runtime_state.k8s_mut()) {
                k8s.pods.remove(&pod_id);
            }
        }
        Action::ComposeEvent { manifest, container_id, status, time } => {
            if let Some(t) = state.manifest_target_mut(&manifest) {
                let prev = t.state.runtime_state.compose().cloned().unwrap_or_default();
                t.state.runtime_state = RuntimeState::DockerCompose(ComposeRuntimeState {
                    container_id: container_id.or(prev.container_id),
                    status,
                    last_event_time: Some(time),
                });
            }
        }
        Action::PortForwardStatus { manifest, error } => {
            if let Some(t) = state.manifest_target_mut(&manifest) {
                t.state.port_forward_error = error;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::{DeployTarget, DockerComposeTarget, K8sTarget, PodPhase};

    fn state_with(manifest: Manifest) -> EngineState {
        let mut es = EngineState::new();
        reduce(&mut es, Action::ManifestUpsert(manifest));
        es
    }

    fn k8s(name: &str) -> Manifest {
        Manifest::new(name, DeployTarget::Kubernetes(K8sTarget::default()))
    }

    #[test]
    fn pod_change_and_delete() {
        let mut es = state_with(k8s("fe"));
        reduce(&mut es, Action::PodChange { manifest: "fe".into(), pod: Pod::new("p1", PodPhase::Pending) });
        reduce(&mut es, Action::PodChange { manifest: "fe".into(), pod: Pod::new("p1", PodPhase::Running) });
        reduce(&mut es, Action::PodChange { manifest: "fe".into(), pod: Pod::new("p2", PodPhase::Running) });
        let pods = &es.manifest_target("fe").unwrap().state.k8s_runtime_state().unwrap().pods;
        assert_eq!(pods.len(), 2);
        assert!(pods["p1"].is_running());

        reduce(&mut es, Action::PodDelete { manifest: "fe".into(), pod_id: "p1".into() });
        let pods = &es.manifest_target("fe").unwrap().state.k8s_runtime_state().unwrap().pods;
        assert_eq!(pods.keys().collect::<Vec<_>>(), vec!["p2"]);
    }

    #[test]
    fn compose_event_replaces_runtime_variant() {
        let m = Manifest::new("db", DeployTarget::DockerCompose(DockerComposeTarget { service: "db".into(), ..Default::default() }));
        let mut es = state_with(m);
        reduce(&mut es, Action::PodChange { manifest: "db".into(), pod: Pod::new("stray", PodPhase::Running) });
        let now = Utc::now();
        reduce(&mut es, Action::ComposeEvent { manifest: "db".into(), container_id: Some("abc".into()), status: "start".into(), time: now });
        reduce(&mut es, Action::ComposeEvent { manifest: "db".into(), container_id: None, status: "die".into(), time: now });
        let rs = &es.manifest_target("db").unwrap().state.runtime_state;
        assert!(rs.k8s().is_none());
        let c = rs.compose().unwrap();
        assert_eq!(c.container_id.as_deref(), Some("abc"));
        assert_eq!(c.status, "die");
    }

    #[test]
    fn unknown_manifest_is_ignored() {
        let mut es = state_with(k8s("fe"));
        reduce(&mut es, Action::PodChange { manifest: "nope".into(), pod: Pod::new("p1", PodPhase::Running) });
        assert_eq!(es.len(), 1);
        assert!(es.manifest_target("nope").is_none());
    }

    #[test]
    fn build_lifecycle() {
        let mut es = state_with(k8s("fe"));
        let start = Utc::now();
        reduce(&mut es, Action::BuildStarted { manifest: "fe".into(), reason: BuildReason::Init, start_time: start });
        assert!(es.manifest_target("fe").unwrap().state.current_build.is_some());
        let record = BuildRecord { reason: BuildReason::Init, error: None, start_time: start, finish_time: start, edits: vec![], log: "ok".into() };
        reduce(&mut es, Action::BuildCompleted { manifest: "fe".into(), record: record.clone() });
        let st = &es.manifest_target("fe").unwrap().state;
        assert!(st.current_build.is_none());
        assert_eq!(st.build_history(), &[record]);
    }
}
