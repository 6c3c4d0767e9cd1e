//! drydock ops: imperative Kubernetes operations the controllers drive.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use drydock_core::{CancelHandle, StreamHandle};
use kube::{api::Api, Client};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub mod fake;

pub use fake::FakeClusterOps;

/// Lifecycle of one forward. `Closed` while the handle is not cancelled means the listener died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    Ready(String),
    Connected(String),
    Closed,
    Error(String),
}

/// Cluster capabilities the engine needs. Methods may stream; every stream is cancellable.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Forward `local` on the bind address to `remote` in the pod. The listener is bound
    /// before this returns, so "address in use" surfaces here rather than on the stream.
    async fn port_forward(&self, namespace: &str, pod: &str, local: u16, remote: u16) -> Result<StreamHandle<ForwardEvent>>;
}

/// Default implementation using kube-rs client APIs.
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self { Self { client } }

    fn pods(&self, namespace: &str) -> Api<k8s_openapi::api::core::v1::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeOps {
    async fn port_forward(&self, namespace: &str, pod: &str, local: u16, remote: u16) -> Result<StreamHandle<ForwardEvent>> {
        use tokio::net::TcpListener;

        let api = self.pods(namespace);
        let bind_addr = std::env::var("DRYDOCK_PF_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listener = TcpListener::bind((bind_addr.as_str(), local))
            .await
            .with_context(|| format!("binding {}:{} for pod {}/{}", bind_addr, local, namespace, pod))?;
        let actual = listener.local_addr()?;

        let (tx, rx) = mpsc::channel::<ForwardEvent>(16);
        let cancel = CancelHandle::new();
        let token = cancel.token();
        let _ = tx.send(ForwardEvent::Ready(actual.to_string())).await;
        info!(pod = %pod, ns = %namespace, local = %actual, remote, "port-forward listening");

        let pod_name = pod.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => { let _ = tx.send(ForwardEvent::Closed).await; break; }
                    accept_res = listener.accept() => {
                        match accept_res {
                            Ok((inbound, peer)) => {
                                counter!("portforward_connections", 1);
                                let _ = tx.send(ForwardEvent::Connected(peer.to_string())).await;
                                let api = api.clone();
                                let pod = pod_name.clone();
                                let tx = tx.clone();
                                let token = token.clone();
                                tokio::spawn(async move {
                                    tokio::select! {
                                        _ = token.cancelled() => {}
                                        res = forward_connection(api, &pod, remote, inbound) => {
                                            if let Err(e) = res {
                                                let _ = tx.send(ForwardEvent::Error(format!("{:#}", e))).await;
                                            }
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                let _ = tx.send(ForwardEvent::Error(format!("accept error: {}", e))).await;
                                let _ = tx.send(ForwardEvent::Closed).await;
                                break;
                            }
                        }
                    }
                }
            }
            debug!(pod = %pod_name, remote, "port-forward listener closed");
        });
        Ok(StreamHandle { rx, cancel })
    }
}

// One upstream portforward per accepted connection; a kube Portforwarder hands out a
// single stream per port.
async fn forward_connection(
    api: Api<k8s_openapi::api::core::v1::Pod>,
    pod: &str,
    remote: u16,
    mut inbound: tokio::net::TcpStream,
) -> Result<()> {
    let mut pf = api.portforward(pod, &[remote]).await.with_context(|| format!("opening portforward to {}:{}", pod, remote))?;
    let mut upstream = pf.take_stream(remote).ok_or_else(|| anyhow!("pf stream missing for port {}", remote))?;
    tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await?;
    Ok(())
}
