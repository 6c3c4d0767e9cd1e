//! Cancellable stream handles shared by the kube ops and the compose client.

#![forbid(unsafe_code)]

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cancellation handle for an in-flight operation. Cancelling twice, or after the
/// operation already ended, is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.token.cancel(); }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Token observed by the task doing the work.
    pub fn token(&self) -> CancellationToken { self.token.clone() }
}

/// Result of starting a streaming operation.
#[derive(Debug)]
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

impl<T> StreamHandle<T> {
    pub fn new(rx: mpsc::Receiver<T>, cancel: CancelHandle) -> Self { Self { rx, cancel } }
}

/// Channel capacity for streaming ops, overridable with `DRYDOCK_OPS_QUEUE_CAP`.
pub fn queue_cap() -> usize {
    std::env::var("DRYDOCK_OPS_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_visible_to_the_worker_and_idempotent() {
        let (tx, rx) = mpsc::channel::<u32>(4);
        let handle = StreamHandle::new(rx, CancelHandle::new());
        let token = handle.cancel.token();
        let worker = tokio::spawn(async move {
            let mut sent = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {
                        if tx.try_send(sent).is_ok() { sent += 1; }
                    }
                }
            }
            sent
        });
        handle.cancel.cancel();
        handle.cancel.cancel();
        assert!(handle.cancel.is_cancelled());
        tokio::time::timeout(std::time::Duration::from_secs(1), worker).await.expect("worker did not stop").expect("join");
    }
}
