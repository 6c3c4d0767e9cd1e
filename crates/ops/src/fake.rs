//! In-memory `ClusterOps` for tests: records what was forwarded instead of dialing a cluster.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use drydock_core::{CancelHandle, StreamHandle};
use tokio::sync::mpsc;

use crate::{ClusterOps, ForwardEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCall {
    pub namespace: String,
    pub pod: String,
    pub local: u16,
    pub remote: u16,
}

struct LiveForward {
    local: u16,
    cancel: CancelHandle,
    events: mpsc::Sender<ForwardEvent>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<ForwardCall>,
    forwards: Vec<LiveForward>,
    failing_local_ports: HashSet<u16>,
}

#[derive(Default)]
pub struct FakeClusterOps {
    inner: Mutex<Inner>,
}

impl FakeClusterOps {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make forwards on `port` fail as if the port were already bound.
    pub fn fail_local_port(&self, port: u16) { self.lock().failing_local_ports.insert(port); }

    pub fn clear_failures(&self) { self.lock().failing_local_ports.clear(); }

    /// Kill the newest live forward on `local` the way a dying listener does: an error, then `Closed`.
    pub fn kill_forward(&self, local: u16, error: &str) -> bool {
        let inner = self.lock();
        let Some(fwd) = inner.forwards.iter().rev().find(|f| f.local == local && !f.cancel.is_cancelled()) else {
            return false;
        };
        fwd.events.try_send(ForwardEvent::Error(error.to_string())).is_ok() && fwd.events.try_send(ForwardEvent::Closed).is_ok()
    }

    pub fn start_count(&self) -> usize { self.lock().calls.len() }

    pub fn stop_count(&self) -> usize { self.lock().forwards.iter().filter(|f| f.cancel.is_cancelled()).count() }

    /// Forwards started and not yet cancelled.
    pub fn live_count(&self) -> usize { self.lock().forwards.iter().filter(|f| !f.cancel.is_cancelled()).count() }

    pub fn last_forward_pod_id(&self) -> Option<String> { self.lock().calls.last().map(|c| c.pod.clone()) }

    pub fn last_forward_remote_port(&self) -> Option<u16> { self.lock().calls.last().map(|c| c.remote) }
}

#[async_trait::async_trait]
impl ClusterOps for FakeClusterOps {
    async fn port_forward(&self, namespace: &str, pod: &str, local: u16, remote: u16) -> Result<StreamHandle<ForwardEvent>> {
        let mut inner = self.lock();
        if inner.failing_local_ports.contains(&local) {
            return Err(anyhow!("listen tcp 127.0.0.1:{}: bind: address already in use", local));
        }
        inner.calls.push(ForwardCall { namespace: namespace.to_string(), pod: pod.to_string(), local, remote });
        let cancel = CancelHandle::new();
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.try_send(ForwardEvent::Ready(format!("127.0.0.1:{}", local)));
        inner.forwards.push(LiveForward { local, cancel: cancel.clone(), events: tx });
        Ok(StreamHandle::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn killed_forward_reports_error_then_closes() {
        let ops = FakeClusterOps::new();
        let mut h = ops.port_forward("default", "pod-a", 8080, 80).await.expect("forward");
        assert_eq!(h.rx.recv().await, Some(ForwardEvent::Ready("127.0.0.1:8080".into())));

        assert!(ops.kill_forward(8080, "accept error: boom"));
        assert_eq!(h.rx.recv().await, Some(ForwardEvent::Error("accept error: boom".into())));
        assert_eq!(h.rx.recv().await, Some(ForwardEvent::Closed));
        assert!(!ops.kill_forward(9090, "nothing there"));
    }

    #[tokio::test]
    async fn failing_port_is_rejected_until_cleared() {
        let ops = FakeClusterOps::new();
        ops.fail_local_port(8080);
        let err = ops.port_forward("default", "pod-a", 8080, 80).await.expect_err("bound");
        assert!(err.to_string().contains("address already in use"));
        assert_eq!(ops.start_count(), 0);

        ops.clear_failures();
        let h = ops.port_forward("default", "pod-a", 8080, 80).await.expect("forward");
        assert_eq!(ops.live_count(), 1);
        h.cancel.cancel();
        assert_eq!((ops.live_count(), ops.stop_count()), (0, 1));
    }
}
