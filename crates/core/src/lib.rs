//! drydock core types: desired manifests, observed state, and the engine state the store owns.

#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub mod manifest;
pub mod secrets;
pub mod state;
pub mod stream;
pub mod target;

pub use manifest::{
    ComposeProjectSpec, ComposeService, DeployTarget, DockerComposeTarget, ImageTarget, K8sTarget, LocalTarget, Manifest,
    PortForward,
};
pub use secrets::{Secret, SecretSet};
pub use state::{
    BuildReason, BuildRecord, ComposeRuntimeState, Container, CurrentBuild, K8sRuntimeState, ManifestState, Pod, PodId,
    PodPhase, RuntimeState,
};
pub use stream::{CancelHandle, StreamHandle};
pub use target::{Facet, ManifestTarget};

/// Malformed or contradictory desired spec. Reported to the user; never stops other targets.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("manifest name must not be empty")]
    EmptyName,
    #[error("duplicate manifest name: {0}")]
    DuplicateManifest(String),
    #[error("port forward local port {0} declared more than once")]
    DuplicateLocalPort(u16),
    #[error("port forward local port must be nonzero")]
    ZeroLocalPort,
    #[error("docker compose manifest {0} does not name a service")]
    MissingService(String),
}

/// Everything the store owns. Iteration follows manifest definition order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineState {
    targets: FxHashMap<String, ManifestTarget>,
    definition_order: Vec<String>,
    pub secrets: SecretSet,
    pub paused: bool,
}

impl EngineState {
    pub fn new() -> Self { Self::default() }

    /// Insert a target, or replace only the manifest half of an existing one so that
    /// build history and runtime observations survive spec edits.
    pub fn upsert_manifest_target(&mut self, target: ManifestTarget) {
        let name = target.manifest.name.clone();
        match self.targets.get_mut(&name) {
            Some(existing) => existing.manifest = target.manifest,
            None => {
                self.definition_order.push(name.clone());
                self.targets.insert(name, target);
            }
        }
    }

    pub fn remove_manifest_target(&mut self, name: &str) -> Option<ManifestTarget> {
        self.definition_order.retain(|n| n != name);
        self.targets.remove(name)
    }

    pub fn manifest_target(&self, name: &str) -> Option<&ManifestTarget> { self.targets.get(name) }

    pub fn manifest_target_mut(&mut self, name: &str) -> Option<&mut ManifestTarget> { self.targets.get_mut(name) }

    pub fn manifest_names(&self) -> &[String] { &self.definition_order }

    pub fn targets(&self) -> impl Iterator<Item = &ManifestTarget> + '_ {
        self.definition_order.iter().filter_map(move |n| self.targets.get(n))
    }

    pub fn len(&self) -> usize { self.targets.len() }
    pub fn is_empty(&self) -> bool { self.targets.is_empty() }
}

pub mod prelude {
    pub use super::{
        BuildReason, BuildRecord, DeployTarget, EngineState, K8sRuntimeState, Manifest, ManifestState, ManifestTarget, Pod,
        PodPhase, PortForward, RuntimeState,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k8s(name: &str, pfs: Vec<PortForward>) -> Manifest {
        Manifest::new(name, DeployTarget::Kubernetes(K8sTarget { port_forwards: pfs, ..Default::default() }))
    }

    #[test]
    fn upsert_keeps_state_and_order() {
        let mut es = EngineState::new();
        es.upsert_manifest_target(ManifestTarget::new(k8s("b", vec![])));
        es.upsert_manifest_target(ManifestTarget::new(k8s("a", vec![PortForward::explicit(8080, 8081)])));
        es.manifest_target_mut("a").unwrap().state.runtime_state =
            RuntimeState::Kubernetes(K8sRuntimeState::with_pod(Pod::new("pod-id", PodPhase::Running)));

        es.upsert_manifest_target(ManifestTarget::new(k8s("a", vec![PortForward::explicit(8080, 8082)])));

        let names: Vec<&str> = es.targets().map(|t| t.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
        let a = es.manifest_target("a").unwrap();
        assert_eq!(a.manifest.k8s().unwrap().port_forwards[0].container_port, Some(8082));
        assert!(a.state.k8s_runtime_state().is_some());
    }

    #[test]
    fn remove_drops_from_order() {
        let mut es = EngineState::new();
        es.upsert_manifest_target(ManifestTarget::new(k8s("a", vec![])));
        assert!(es.remove_manifest_target("a").is_some());
        assert!(es.remove_manifest_target("a").is_none());
        assert!(es.manifest_names().is_empty());
        assert!(es.is_empty());
    }
}
