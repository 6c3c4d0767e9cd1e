//! drydock kubehub: list+watch the pods drydock deployed and feed them into the store.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use drydock_core::{Container, Pod, PodPhase};
use drydock_store::{Action, Store};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label drydock puts on every pod it deploys; the value is the manifest name.
pub const MANIFEST_LABEL: &str = "drydock.dev/manifest";

/// Convert an API pod into the model pod, with the manifest it belongs to.
/// Pods without the manifest label or a name are not ours.
pub fn pod_from_k8s(obj: &K8sPod) -> Option<(String, Pod)> {
    let meta = &obj.metadata;
    let manifest = meta.labels.as_ref()?.get(MANIFEST_LABEL)?.clone();
    let pod_id = meta.name.clone()?;
    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    let status = obj.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).and_then(PodPhase::parse);
    let start_time = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);

    let statuses = status.and_then(|s| s.container_statuses.as_ref());
    let containers = obj
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| {
                    let id = statuses
                        .and_then(|ss| ss.iter().find(|s| s.name == c.name))
                        .and_then(|s| s.container_id.clone())
                        .unwrap_or_default();
                    let ports: SmallVec<[u16; 4]> = c
                        .ports
                        .iter()
                        .flatten()
                        .filter_map(|p| u16::try_from(p.container_port).ok())
                        .collect();
                    Container { id, name: c.name.clone(), ports }
                })
                .collect()
        })
        .unwrap_or_default();

    Some((manifest, Pod { pod_id, namespace, phase, start_time, containers }))
}

/// Watch labelled pods until `ctx` is cancelled or the watch stream fails.
pub async fn watch_pods(client: Client, namespace: Option<&str>, store: Arc<Store>, ctx: CancellationToken) -> Result<()> {
    let api: Api<K8sPod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default().labels(MANIFEST_LABEL);
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(ns = ?namespace, label = MANIFEST_LABEL, "pod watcher started");
    loop {
        let ev = tokio::select! {
            _ = ctx.cancelled() => break,
            ev = stream.try_next() => ev.context("pod watch stream")?,
        };
        let Some(ev) = ev else { break };
        match ev {
            Event::Applied(o) => apply_pod(&store, &o),
            Event::Deleted(o) => {
                if let Some((manifest, pod)) = pod_from_k8s(&o) {
                    counter!("pod_watch_events", 1, "kind" => "deleted");
                    store.dispatch(Action::PodDelete { manifest, pod_id: pod.pod_id });
                }
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "pod watch restart");
                let mut seen = HashSet::new();
                for o in list.iter() {
                    if let Some((manifest, pod)) = pod_from_k8s(o) {
                        seen.insert((manifest, pod.pod_id));
                    }
                    apply_pod(&store, o);
                }
                prune_missing(&store, &seen);
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}

fn apply_pod(store: &Store, obj: &K8sPod) {
    if let Some((manifest, pod)) = pod_from_k8s(obj) {
        counter!("pod_watch_events", 1, "kind" => "applied");
        store.dispatch(Action::PodChange { manifest, pod });
    }
}

// After a relist, pods deleted while we were disconnected never produce a Deleted event.
fn prune_missing(store: &Store, seen: &HashSet<(String, String)>) {
    let snap = store.snapshot();
    for t in snap.targets() {
        let Some(k8s) = t.state.k8s_runtime_state() else { continue };
        for pod_id in k8s.pods.keys() {
            if !seen.contains(&(t.name().to_string(), pod_id.clone())) {
                store.dispatch(Action::PodDelete { manifest: t.name().to_string(), pod_id: pod_id.clone() });
            }
        }
    }
}
