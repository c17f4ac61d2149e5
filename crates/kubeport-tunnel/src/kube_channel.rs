//! Port-forward channel over the Kubernetes API server.
//!
//! Every sub-stream gets its own `Portforwarder`, so each one carries a fresh
//! data/error stream pair and its own request id on the server side. The
//! forwarder opened while upgrading is kept and handed to the first
//! sub-stream.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::Portforwarder;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use kubeport_k8s::ClusterClient;
use kubeport_types::{ServiceSelector, TargetSelector};

use crate::channel::{Channel, Connector, StreamId, TunnelIo};
use crate::error::{TunnelError, resolution_error};
use crate::forward::Provisioner;

/// How often the pod behind a channel is checked
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// How long forwarders get to flush after shutdown
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Connector backed by a live cluster
#[derive(Clone)]
pub struct KubeConnector {
    cluster: ClusterClient,
}

impl KubeConnector {
    pub fn new(cluster: ClusterClient) -> Self {
        Self { cluster }
    }

    /// Cluster client scoped to `namespace`
    fn scoped(&self, namespace: &str) -> ClusterClient {
        if namespace == self.cluster.namespace() {
            self.cluster.clone()
        } else {
            ClusterClient::new(self.cluster.client().clone(), namespace)
        }
    }
}

impl Connector for KubeConnector {
    type Channel = KubeChannel;

    async fn resolve(&self, namespace: &str, target: &TargetSelector) -> Result<String, TunnelError> {
        let pod = self
            .scoped(namespace)
            .resolve_ready_pod(target)
            .await
            .map_err(|e| resolution_error(&target.to_string(), e))?;

        debug!(target = %target, pod = %pod.name, node = ?pod.node_name, "target resolved");
        Ok(pod.name)
    }

    async fn upgrade(
        &self,
        namespace: &str,
        pod: &str,
        remote_ports: &BTreeSet<u16>,
    ) -> Result<KubeChannel, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.cluster.client().clone(), namespace);
        KubeChannel::connect(pods, pod, remote_ports).await
    }
}

impl Provisioner for ClusterClient {
    async fn ensure_service(&self, selector: &ServiceSelector) -> Result<(), TunnelError> {
        ClusterClient::ensure_service(self, selector)
            .await
            .map(|outcome| debug!(service = %selector.name, ?outcome, "service ready"))
            .map_err(|source| TunnelError::Provision {
                target: selector.target_app.clone(),
                source,
            })
    }
}

/// Port-forward channel to one pod
pub struct KubeChannel {
    pods: Api<Pod>,
    pod: String,
    ports: Vec<u16>,
    primed: Mutex<Option<Portforwarder>>,
    forwarders: TaskTracker,
    shutdown: CancellationToken,
}

impl KubeChannel {
    /// Upgrade a connection to `pod` for `ports`.
    ///
    /// The upgrade is performed here so a refusal surfaces as `Upgrade`
    /// before the session is reported open.
    pub async fn connect(
        pods: Api<Pod>,
        pod: &str,
        ports: &BTreeSet<u16>,
    ) -> Result<Self, TunnelError> {
        let ports: Vec<u16> = ports.iter().copied().collect();
        let forwarder = pods
            .portforward(pod, &ports)
            .await
            .map_err(|e| TunnelError::upgrade(pod, e))?;

        debug!(pod, ports = ?ports, "port-forward upgraded");

        Ok(Self {
            pods,
            pod: pod.to_string(),
            ports,
            primed: Mutex::new(Some(forwarder)),
            forwarders: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    async fn forwarder_for(&self, remote_port: u16) -> Result<Portforwarder, TunnelError> {
        let primed = self.primed.lock().take();
        match primed {
            Some(forwarder) => Ok(forwarder),
            None => self
                .pods
                .portforward(&self.pod, &[remote_port])
                .await
                .map_err(|e| TunnelError::upgrade(&self.pod, e)),
        }
    }

    /// Keep the forwarder running until it finishes or the channel shuts down
    fn track(&self, mut forwarder: Portforwarder, id: StreamId, remote_port: u16) {
        if let Some(errors) = forwarder.take_error(remote_port) {
            let shutdown = self.shutdown.clone();
            let pod = self.pod.clone();
            self.forwarders.spawn(async move {
                tokio::select! {
                    message = errors => {
                        if let Some(message) = message {
                            warn!(pod = %pod, stream_id = %id, remote_port, error = %message, "pod reported port-forward error");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        let shutdown = self.shutdown.clone();
        let pod = self.pod.clone();
        self.forwarders.spawn(async move {
            let join = forwarder.join();
            tokio::pin!(join);

            let finished = tokio::select! {
                result = &mut join => Some(result),
                _ = shutdown.cancelled() => None,
            };
            let result = match finished {
                Some(result) => result,
                None => match tokio::time::timeout(DRAIN_GRACE, join).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(pod = %pod, stream_id = %id, "forwarder did not drain in time");
                        return;
                    }
                },
            };

            if let Err(e) = result {
                debug!(pod = %pod, stream_id = %id, error = %e, "forwarder ended with error");
            }
        });
    }
}

impl Channel for KubeChannel {
    type Stream = Box<dyn TunnelIo>;

    async fn open_stream(&self, id: StreamId, remote_port: u16) -> Result<Box<dyn TunnelIo>, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }

        let mut forwarder = self.forwarder_for(remote_port).await?;
        let stream = forwarder.take_stream(remote_port).ok_or_else(|| {
            TunnelError::upgrade(&self.pod, format!("port {} missing from forwarder", remote_port))
        })?;

        // A primed forwarder carries every port; only one is used per sub-stream
        for &port in &self.ports {
            if port != remote_port {
                drop(forwarder.take_stream(port));
            }
        }

        self.track(forwarder, id, remote_port);
        Ok(Box::new(stream))
    }

    async fn closed(&self) -> String {
        let mut interval = tokio::time::interval(LIVENESS_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.pods.get_opt(&self.pod).await {
                Ok(Some(pod)) => {
                    if let Some(reason) = liveness_failure(&pod) {
                        return reason;
                    }
                }
                Ok(None) => return format!("pod {} was deleted", self.pod),
                // The API server may hiccup; only the pod's own state ends the channel
                Err(e) => debug!(pod = %self.pod, error = %e, "liveness check failed"),
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        drop(self.primed.lock().take());
        self.forwarders.close();
        self.forwarders.wait().await;
    }
}

/// Why a pod can no longer carry a port-forward, if it cannot
fn liveness_failure(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    if pod.metadata.deletion_timestamp.is_some() {
        return Some(format!("pod {} is terminating", name));
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    if phase != "Running" {
        return Some(format!("pod {} left Running (now {})", name, phase));
    }

    None
}
