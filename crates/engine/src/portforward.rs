//! Keeps one set of local port-forwards running per Kubernetes manifest, pointed at the
//! manifest's current running pod.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use drydock_core::{CancelHandle, ConfigError, EngineState, ManifestTarget, Pod, PortForward};
use drydock_ops::{ClusterOps, ForwardEvent};
use drydock_store::{Action, Store, Subscriber};
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a running forward is bound to. Two equal identities need no restart.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardIdentity {
    namespace: String,
    pod_id: String,
    /// Resolved: every entry has a container port.
    forwards: Vec<PortForward>,
}

struct ActiveForward {
    identity: ForwardIdentity,
    handles: Vec<CancelHandle>,
}

impl ActiveForward {
    fn cancel(&self) {
        for h in &self.handles {
            h.cancel();
        }
    }

    // a supervisor cancels its own handle when the listener dies
    fn is_dead(&self) -> bool { self.handles.iter().any(CancelHandle::is_cancelled) }
}

/// Last error surfaced per manifest, shared with the forward supervisors.
/// Unchanged statuses are not re-dispatched.
#[derive(Default)]
struct StatusBook {
    reported: StdMutex<HashMap<String, String>>,
}

impl StatusBook {
    fn report(&self, store: &Store, name: &str, error: Option<String>) {
        let mut reported = self.lock();
        let changed = match &error {
            Some(e) => reported.get(name) != Some(e),
            None => reported.contains_key(name),
        };
        if !changed {
            return;
        }
        match &error {
            Some(e) => reported.insert(name.to_string(), e.clone()),
            None => reported.remove(name),
        };
        drop(reported);
        store.dispatch(Action::PortForwardStatus { manifest: name.to_string(), error });
    }

    /// Clear the status of every manifest that no longer wants a forward.
    fn clear_undesired<T>(&self, store: &Store, desired: &HashMap<String, T>) {
        let gone: Vec<String> = self.lock().keys().filter(|name| !desired.contains_key(*name)).cloned().collect();
        for name in gone {
            self.report(store, &name, None);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PortForwardController {
    ops: Arc<dyn ClusterOps>,
    store: Arc<Store>,
    active: Mutex<HashMap<String, ActiveForward>>,
    status: Arc<StatusBook>,
}

impl PortForwardController {
    pub fn new(ops: Arc<dyn ClusterOps>, store: Arc<Store>) -> Self {
        Self { ops, store, active: Mutex::new(HashMap::new()), status: Arc::new(StatusBook::default()) }
    }

    pub async fn active_forward_count(&self) -> usize { self.active.lock().await.len() }

    /// One reconcile pass against the current snapshot.
    pub async fn reconcile(&self, ctx: &CancellationToken, store: &Store) {
        let snap = store.snapshot();
        let desired = desired_forwards(&snap);
        let mut active = self.active.lock().await;

        let stale: Vec<String> = active
            .iter()
            .filter(|(name, af)| af.is_dead() || !matches!(desired.get(*name), Some(Ok(Some(want))) if *want == af.identity))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(af) = active.remove(&name) {
                af.cancel();
                counter!("portforward_stops", 1);
                info!(manifest = %name, pod = %af.identity.pod_id, "port-forward stopped");
            }
        }

        for (name, want) in &desired {
            let want = match want {
                Ok(w) => w,
                Err(e) => {
                    self.status.report(store, name, Some(e.to_string()));
                    continue;
                }
            };
            let Some(identity) = want else {
                self.status.report(store, name, None);
                continue;
            };
            if active.contains_key(name) {
                continue;
            }
            match self.start(ctx, name, identity).await {
                Ok(handles) => {
                    active.insert(name.clone(), ActiveForward { identity: identity.clone(), handles });
                    self.status.report(store, name, None);
                }
                Err(e) => self.status.report(store, name, Some(e)),
            }
        }

        self.status.clear_undesired(store, &desired);
    }

    // All or nothing: a partial set is torn down so the next cycle retries the whole identity.
    async fn start(&self, ctx: &CancellationToken, name: &str, identity: &ForwardIdentity) -> Result<Vec<CancelHandle>, String> {
        let mut handles = Vec::with_capacity(identity.forwards.len());
        for pf in &identity.forwards {
            let remote = pf.container_port.unwrap_or(pf.local_port);
            match self.ops.port_forward(&identity.namespace, &identity.pod_id, pf.local_port, remote).await {
                Ok(h) => {
                    let sup = Supervisor {
                        manifest: name.to_string(),
                        label: format!("port-forward {}:{} ({})", pf.local_port, remote, identity.pod_id),
                        handle: h.cancel.clone(),
                        store: self.store.clone(),
                        status: self.status.clone(),
                    };
                    tokio::spawn(sup.run(h.rx, ctx.child_token()));
                    handles.push(h.cancel);
                }
                Err(e) => {
                    for h in &handles {
                        h.cancel();
                    }
                    counter!("portforward_failures", 1);
                    warn!(manifest = %name, pod = %identity.pod_id, local = pf.local_port, remote, error = %e, "port-forward failed");
                    return Err(format!("port-forward {}:{}: {:#}", pf.local_port, remote, e));
                }
            }
        }
        counter!("portforward_starts", 1);
        info!(manifest = %name, pod = %identity.pod_id, forwards = handles.len(), "port-forward started");
        Ok(handles)
    }
}

/// Watches one forward's events. Errors go to the manifest's status; a listener that closes
/// without being cancelled is marked dead so the next reconcile restarts it.
struct Supervisor {
    manifest: String,
    label: String,
    handle: CancelHandle,
    store: Arc<Store>,
    status: Arc<StatusBook>,
}

impl Supervisor {
    async fn run(self, mut rx: mpsc::Receiver<ForwardEvent>, ctx: CancellationToken) {
        let stopped = self.handle.token();
        let mut last_error = None;
        loop {
            let ev = tokio::select! {
                _ = ctx.cancelled() => return,
                _ = stopped.cancelled() => return,
                ev = rx.recv() => ev,
            };
            match ev {
                Some(ForwardEvent::Ready(addr)) => info!(manifest = %self.manifest, forward = %self.label, %addr, "forward ready"),
                Some(ForwardEvent::Connected(peer)) => debug!(manifest = %self.manifest, forward = %self.label, %peer, "forward connection"),
                Some(ForwardEvent::Error(e)) => {
                    warn!(manifest = %self.manifest, forward = %self.label, error = %e, "forward error");
                    self.status.report(&self.store, &self.manifest, Some(format!("{}: {}", self.label, e)));
                    last_error = Some(e);
                }
                Some(ForwardEvent::Closed) | None => break,
            }
        }
        if self.handle.is_cancelled() {
            return;
        }
        // mark dead before reporting so the reconcile the report triggers sees it
        self.handle.cancel();
        counter!("portforward_failures", 1);
        let cause = last_error.unwrap_or_else(|| "listener exited".to_string());
        warn!(manifest = %self.manifest, forward = %self.label, %cause, "port-forward closed unexpectedly");
        self.status.report(&self.store, &self.manifest, Some(format!("{}: closed: {}", self.label, cause)));
    }
}

#[async_trait::async_trait]
impl Subscriber for PortForwardController {
    fn name(&self) -> &str { "portforward" }

    async fn on_change(&self, ctx: &CancellationToken, store: &Store) { self.reconcile(ctx, store).await }

    async fn teardown(&self) {
        let mut active = self.active.lock().await;
        for (name, af) in active.drain() {
            af.cancel();
            debug!(manifest = %name, "port-forward cancelled on shutdown");
        }
    }
}

/// Desired forward per manifest that declares any. `Ok(None)` means "no forward right now".
fn desired_forwards(state: &EngineState) -> HashMap<String, Result<Option<ForwardIdentity>, ConfigError>> {
    state
        .targets()
        .filter(|t| t.manifest.k8s().map_or(false, |k| !k.port_forwards.is_empty()))
        .map(|t| (t.name().to_string(), desired_identity(t)))
        .collect()
}

fn desired_identity(t: &ManifestTarget) -> Result<Option<ForwardIdentity>, ConfigError> {
    let Some(k8s) = t.manifest.k8s() else { return Ok(None) };
    k8s.validate_port_forwards()?;
    let Some(pod) = t.state.k8s_runtime_state().and_then(|k| k.most_recent_pod()) else { return Ok(None) };
    if !pod.is_running() {
        return Ok(None);
    }
    let forwards = populate_port_forwards(&k8s.port_forwards, pod);
    if forwards.is_empty() {
        return Ok(None);
    }
    Ok(Some(ForwardIdentity { namespace: pod.namespace.clone(), pod_id: pod.pod_id.clone(), forwards }))
}

/// Fill in missing container ports from what the pod declares.
///
/// This is a heuristic. A declared local port that the pod also exposes maps to itself;
/// otherwise a pod with a single container exposing a single port maps to that port.
/// Anything else stays unresolved and is left out until more of the pod is observed.
/// Explicit container ports are never second-guessed.
pub fn populate_port_forwards(declared: &[PortForward], pod: &Pod) -> Vec<PortForward> {
    let all_ports: BTreeSet<u16> = pod.containers.iter().flat_map(|c| c.ports.iter().copied()).collect();
    let only_port = match pod.containers.as_slice() {
        [only] if only.ports.len() == 1 => Some(only.ports[0]),
        _ => None,
    };
    declared
        .iter()
        .filter_map(|pf| {
            let remote = match pf.container_port {
                Some(p) => p,
                None if all_ports.contains(&pf.local_port) => pf.local_port,
                None => only_port?,
            };
            Some(PortForward::explicit(pf.local_port, remote))
        })
        .collect()
}
