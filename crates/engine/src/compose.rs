//! Docker Compose controllers: bring services up when their manifest appears or changes,
//! and fold `events --json` output back into the store.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use drydock_compose::DockerComposeClient;
use drydock_core::{BuildReason, BuildRecord, CancelHandle, ComposeProjectSpec, DockerComposeTarget};
use drydock_store::{Action, Store, Subscriber};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs `up` for each Compose manifest once per distinct spec.
pub struct ComposeDeployController {
    client: Arc<dyn DockerComposeClient>,
    deployed: Mutex<HashMap<String, DockerComposeTarget>>,
}

impl ComposeDeployController {
    pub fn new(client: Arc<dyn DockerComposeClient>) -> Self { Self { client, deployed: Mutex::new(HashMap::new()) } }

    async fn deploy(&self, store: &Store, name: &str, target: &DockerComposeTarget, reason: BuildReason, should_build: bool) {
        let start_time = Utc::now();
        store.dispatch(Action::BuildStarted { manifest: name.to_string(), reason, start_time });
        let res = self.client.up(&target.service_spec(), should_build).await;
        let (error, log) = match res {
            Ok(out) => (None, format!("{}{}", out.stdout, out.stderr)),
            Err(e) => {
                warn!(manifest = %name, error = %e, "compose up failed");
                (Some(e.to_string()), String::new())
            }
        };
        counter!("compose_deploys", 1, "result" => if error.is_none() { "ok" } else { "error" });
        let record = BuildRecord { reason, error, start_time, finish_time: Utc::now(), edits: Vec::new(), log };
        store.dispatch(Action::BuildCompleted { manifest: name.to_string(), record });
    }
}

#[async_trait::async_trait]
impl Subscriber for ComposeDeployController {
    fn name(&self) -> &str { "compose-deploy" }

    async fn on_change(&self, _ctx: &CancellationToken, store: &Store) {
        let snap = store.snapshot();
        if snap.paused {
            return;
        }
        let mut deployed = self.deployed.lock().await;
        deployed.retain(|name, _| snap.manifest_target(name).map_or(false, |t| t.manifest.compose().is_some()));

        for t in snap.targets() {
            let Some(target) = t.manifest.compose() else { continue };
            let reason = match deployed.get(t.name()) {
                Some(prev) if prev == target => continue,
                Some(_) => BuildReason::ConfigChange,
                None => BuildReason::Init,
            };
            // recorded before running so a failing spec is not retried on every notification
            deployed.insert(t.name().to_string(), target.clone());
            // compose builds images itself unless drydock already built them
            let should_build = t.manifest.builds.is_empty();
            self.deploy(store, t.name(), target, reason, should_build).await;
        }
    }
}

/// One line of `docker-compose events --json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ComposeEventLine {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub time: String,
}

impl ComposeEventLine {
    pub fn parse(line: &str) -> Option<Self> { serde_json::from_str(line).ok() }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.time).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
    }
}

/// Follows `events` for every Compose project referenced by a manifest.
pub struct ComposeEventWatcher {
    client: Arc<dyn DockerComposeClient>,
    store: Arc<Store>,
    watching: Mutex<HashMap<String, (ComposeProjectSpec, CancelHandle)>>,
}

impl ComposeEventWatcher {
    pub fn new(client: Arc<dyn DockerComposeClient>, store: Arc<Store>) -> Self {
        Self { client, store, watching: Mutex::new(HashMap::new()) }
    }

    pub async fn watched_projects(&self) -> Vec<String> {
        let mut v: Vec<String> = self.watching.lock().await.keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait::async_trait]
impl Subscriber for ComposeEventWatcher {
    fn name(&self) -> &str { "compose-events" }

    async fn on_change(&self, ctx: &CancellationToken, store: &Store) {
        let snap = store.snapshot();
        let mut projects: HashMap<String, ComposeProjectSpec> = HashMap::new();
        for t in snap.targets() {
            if let Some(dc) = t.manifest.compose() {
                projects.entry(dc.project.name.clone()).or_insert_with(|| dc.project.clone());
            }
        }

        let mut watching = self.watching.lock().await;
        watching.retain(|name, (spec, handle)| {
            let keep = !handle.is_cancelled() && projects.get(name) == Some(&*spec);
            if !keep {
                handle.cancel();
                debug!(project = %name, "compose event watch stopped");
            }
            keep
        });

        for (name, spec) in projects {
            if watching.contains_key(&name) {
                continue;
            }
            let mut h = self.client.stream_events(&spec);
            let cancel = h.cancel.clone();
            let store = self.store.clone();
            let project = name.clone();
            let ctx = ctx.child_token();
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = ctx.cancelled() => break,
                        item = h.rx.recv() => item,
                    };
                    match item {
                        Some(Ok(line)) => apply_event_line(&store, &project, &line),
                        Some(Err(e)) => {
                            warn!(project = %project, error = %e, "compose events ended with error");
                            break;
                        }
                        None => break,
                    }
                }
                // marks the watch finished so the next notification restarts it
                h.cancel.cancel();
            });
            info!(project = %name, "compose event watch started");
            watching.insert(name, (spec, cancel));
        }
    }

    async fn teardown(&self) {
        for (_, (_, handle)) in self.watching.lock().await.drain() {
            handle.cancel();
        }
    }
}

/// Dispatch one event line to every manifest deploying that project's service.
pub fn apply_event_line(store: &Store, project: &str, line: &str) {
    let Some(ev) = ComposeEventLine::parse(line) else {
        counter!("compose_events", 1, "result" => "unparsed");
        debug!(%project, %line, "unrecognized compose event");
        return;
    };
    let snap = store.snapshot();
    let manifests: Vec<String> = snap
        .targets()
        .filter(|t| t.manifest.compose().map_or(false, |dc| dc.project.name == project && dc.service == ev.service))
        .map(|t| t.name().to_string())
        .collect();
    counter!("compose_events", 1, "result" => if manifests.is_empty() { "unmatched" } else { "ok" });
    let container_id = Some(ev.id.clone()).filter(|id| !id.is_empty());
    for manifest in manifests {
        store.dispatch(Action::ComposeEvent {
            manifest,
            container_id: container_id.clone(),
            status: ev.action.clone(),
            time: ev.timestamp(),
        });
    }
}
