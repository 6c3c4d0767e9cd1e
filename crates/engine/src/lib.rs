//! drydock engine: the controllers that turn store notifications into cluster and compose actions.

#![forbid(unsafe_code)]

use std::sync::Arc;

use drydock_compose::DockerComposeClient;
use drydock_ops::ClusterOps;
use drydock_store::Store;

pub mod compose;
pub mod portforward;

pub use compose::{apply_event_line, ComposeDeployController, ComposeEventLine, ComposeEventWatcher};
pub use portforward::{populate_port_forwards, PortForwardController};

/// Register the standard controller set on `store`. Kubernetes controllers are skipped when
/// no cluster is configured.
pub fn register_controllers(store: &Arc<Store>, ops: Option<Arc<dyn ClusterOps>>, compose: Arc<dyn DockerComposeClient>) {
    if let Some(ops) = ops {
        store.add_subscriber(Arc::new(PortForwardController::new(ops, store.clone())));
    }
    store.add_subscriber(Arc::new(ComposeDeployController::new(compose.clone())));
    store.add_subscriber(Arc::new(ComposeEventWatcher::new(compose, store.clone())));
}
