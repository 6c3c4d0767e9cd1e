//! Observed status: build history and what the runtime reports back.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type PodId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the Kubernetes API.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(PodPhase::Pending),
            "Running" => Some(PodPhase::Running),
            "Succeeded" => Some(PodPhase::Succeeded),
            "Failed" => Some(PodPhase::Failed),
            "Unknown" => Some(PodPhase::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Declared container ports, in spec order.
    pub ports: SmallVec<[u16; 4]>,
}

impl Container {
    pub fn with_ports(ports: &[u16]) -> Self {
        Self { ports: SmallVec::from_slice(ports), ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Pod {
    pub pod_id: PodId,
    pub namespace: String,
    pub phase: Option<PodPhase>,
    pub start_time: Option<DateTime<Utc>>,
    pub containers: Vec<Container>,
}

impl Pod {
    pub fn new(pod_id: impl Into<PodId>, phase: PodPhase) -> Self {
        Self { pod_id: pod_id.into(), namespace: "default".into(), phase: Some(phase), ..Default::default() }
    }

    pub fn is_running(&self) -> bool { self.phase == Some(PodPhase::Running) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct K8sRuntimeState {
    pub pods: BTreeMap<PodId, Pod>,
}

impl K8sRuntimeState {
    pub fn with_pod(pod: Pod) -> Self {
        let mut pods = BTreeMap::new();
        pods.insert(pod.pod_id.clone(), pod);
        Self { pods }
    }

    /// The pod that started last; ties go to the greater pod id so the choice is stable.
    pub fn most_recent_pod(&self) -> Option<&Pod> {
        self.pods.values().max_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.pod_id.cmp(&b.pod_id)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ComposeRuntimeState {
    pub container_id: Option<String>,
    /// Last event action reported by compose (`start`, `die`, ...).
    pub status: String,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// At most one runtime is observed per manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RuntimeState {
    #[default]
    Absent,
    Kubernetes(K8sRuntimeState),
    DockerCompose(ComposeRuntimeState),
}

impl RuntimeState {
    pub fn k8s(&self) -> Option<&K8sRuntimeState> {
        match self { RuntimeState::Kubernetes(k) => Some(k), _ => None }
    }

    pub fn k8s_mut(&mut self) -> Option<&mut K8sRuntimeState> {
        match self { RuntimeState::Kubernetes(k) => Some(k), _ => None }
    }

    pub fn compose(&self) -> Option<&ComposeRuntimeState> {
        match self { RuntimeState::DockerCompose(c) => Some(c), _ => None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BuildReason {
    Init,
    FileChange,
    ConfigChange,
    Manual,
    CrashRebuild,
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildReason::Init => "Initial Build",
            BuildReason::FileChange => "Changed Files",
            BuildReason::ConfigChange => "Config Changed",
            BuildReason::Manual => "Manual Trigger",
            BuildReason::CrashRebuild => "Pod Crashed, Lost live_update Changes",
        };
        f.write_str(s)
    }
}

/// One finished build attempt. Never modified once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecord {
    pub reason: BuildReason,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub edits: Vec<PathBuf>,
    pub log: String,
}

impl BuildRecord {
    pub fn duration(&self) -> Duration {
        (self.finish_time - self.start_time).to_std().unwrap_or_default()
    }

    pub fn succeeded(&self) -> bool { self.error.is_none() }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentBuild {
    pub reason: BuildReason,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ManifestState {
    pub name: String,
    build_history: Vec<BuildRecord>,
    pub current_build: Option<CurrentBuild>,
    pub runtime_state: RuntimeState,
    /// Last port-forward failure surfaced by the forward controller.
    pub port_forward_error: Option<String>,
}

impl ManifestState {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Newest first.
    pub fn build_history(&self) -> &[BuildRecord] { &self.build_history }

    pub fn last_build(&self) -> Option<&BuildRecord> { self.build_history.first() }

    pub fn add_completed_build(&mut self, record: BuildRecord) {
        self.current_build = None;
        self.build_history.insert(0, record);
    }

    pub fn k8s_runtime_state(&self) -> Option<&K8sRuntimeState> { self.runtime_state.k8s() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(secs: i64) -> BuildRecord {
        let start = Utc.timestamp_opt(1_600_000_000 + secs, 0).single().unwrap_or_default();
        BuildRecord {
            reason: BuildReason::FileChange,
            error: None,
            start_time: start,
            finish_time: start + chrono::Duration::milliseconds(1500),
            edits: vec![],
            log: String::new(),
        }
    }

    #[test]
    fn history_is_newest_first() {
        let mut st = ManifestState::new("fe");
        st.add_completed_build(record(1));
        st.add_completed_build(record(2));
        assert_eq!(st.build_history().len(), 2);
        assert_eq!(st.last_build().map(|b| b.start_time), Some(record(2).start_time));
        assert_eq!(st.last_build().map(|b| b.duration()), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn most_recent_pod_prefers_latest_start() {
        let t0 = Utc.timestamp_opt(1_600_000_000, 0).single().unwrap_or_default();
        let mut old = Pod::new("pod-a", PodPhase::Running);
        old.start_time = Some(t0);
        let mut new = Pod::new("pod-b", PodPhase::Pending);
        new.start_time = Some(t0 + chrono::Duration::seconds(5));
        let mut rs = K8sRuntimeState::with_pod(old);
        rs.pods.insert(new.pod_id.clone(), new);
        assert_eq!(rs.most_recent_pod().map(|p| p.pod_id.as_str()), Some("pod-b"));
    }

    #[test]
    fn phase_parse_rejects_unknown_strings() {
        assert_eq!(PodPhase::parse("Running"), Some(PodPhase::Running));
        assert_eq!(PodPhase::parse("Crashing"), None);
    }
}
