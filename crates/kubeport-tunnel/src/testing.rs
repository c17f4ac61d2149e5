//! In-memory connector, channel and provisioner.
//!
//! Sub-streams are `tokio::io::duplex` pairs: the session side is handed to
//! the relay, the far side shows up on [`RemoteEnd`] where a test plays the
//! pod.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kubeport_k8s::ClusterError;
use kubeport_types::{ServiceSelector, TargetSelector};

use crate::channel::{Channel, Connector, StreamId};
use crate::error::TunnelError;
use crate::forward::Provisioner;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Far end of one simulated sub-stream
pub struct RemoteStream {
    pub id: StreamId,
    pub remote_port: u16,
    pub io: DuplexStream,
}

/// Receives the far ends of every sub-stream opened through a [`MemoryConnector`]
pub struct RemoteEnd {
    streams: mpsc::UnboundedReceiver<RemoteStream>,
}

impl RemoteEnd {
    /// Wait for the next sub-stream
    pub async fn accept(&mut self) -> Option<RemoteStream> {
        self.streams.recv().await
    }

    /// Echo every sub-stream back to its sender
    pub fn spawn_echo(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(stream) = self.streams.recv().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(stream.io);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        })
    }
}

/// Connector resolving targets from a fixed table
pub struct MemoryConnector {
    pods: HashMap<String, String>,
    reject_upgrade: Option<String>,
    streams: mpsc::UnboundedSender<RemoteStream>,
    failure: CancellationToken,
    upgrades: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, RemoteEnd) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            pods: HashMap::new(),
            reject_upgrade: None,
            streams: tx,
            failure: CancellationToken::new(),
            upgrades: Arc::new(AtomicUsize::new(0)),
        };
        (connector, RemoteEnd { streams: rx })
    }

    /// Route a target name (service, deployment or pod) to a pod
    pub fn with_pod(mut self, target: &str, pod: &str) -> Self {
        self.pods.insert(target.to_string(), pod.to_string());
        self
    }

    /// Refuse every upgrade with `reason`
    pub fn rejecting_upgrades(mut self, reason: &str) -> Self {
        self.reject_upgrade = Some(reason.to_string());
        self
    }

    /// Make every channel handed out so far, and later, report failure
    pub fn fail_channels(&self) {
        self.failure.cancel();
    }

    /// Number of successful upgrades
    pub fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    type Channel = MemoryChannel;

    async fn resolve(&self, _namespace: &str, target: &TargetSelector) -> Result<String, TunnelError> {
        self.pods
            .get(target.name())
            .cloned()
            .ok_or_else(|| TunnelError::Resolution {
                target: target.to_string(),
                reason: "no pod matches".to_string(),
            })
    }

    async fn upgrade(
        &self,
        _namespace: &str,
        pod: &str,
        _remote_ports: &BTreeSet<u16>,
    ) -> Result<MemoryChannel, TunnelError> {
        if let Some(reason) = &self.reject_upgrade {
            return Err(TunnelError::upgrade(pod, reason));
        }

        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryChannel {
            streams: self.streams.clone(),
            failure: self.failure.clone(),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Channel that hands out duplex pairs
pub struct MemoryChannel {
    streams: mpsc::UnboundedSender<RemoteStream>,
    failure: CancellationToken,
    shutdown: CancellationToken,
}

impl Channel for MemoryChannel {
    type Stream = DuplexStream;

    async fn open_stream(&self, id: StreamId, remote_port: u16) -> Result<DuplexStream, TunnelError> {
        if self.shutdown.is_cancelled() || self.failure.is_cancelled() {
            return Err(TunnelError::Closed);
        }

        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        self.streams
            .send(RemoteStream {
                id,
                remote_port,
                io: far,
            })
            .map_err(|_| TunnelError::Closed)?;
        Ok(near)
    }

    async fn closed(&self) -> String {
        self.failure.cancelled().await;
        "simulated channel failure".to_string()
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Provisioner that records calls instead of talking to a cluster
#[derive(Clone, Default)]
pub struct MemoryProvisioner {
    provisioned: Arc<parking_lot::Mutex<Vec<ServiceSelector>>>,
    fail: bool,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every provisioning request
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Services provisioned so far
    pub fn provisioned(&self) -> Vec<ServiceSelector> {
        self.provisioned.lock().clone()
    }
}

impl Provisioner for MemoryProvisioner {
    async fn ensure_service(&self, selector: &ServiceSelector) -> Result<(), TunnelError> {
        if self.fail {
            return Err(TunnelError::Provision {
                target: selector.target_app.clone(),
                source: ClusterError::ServiceConflict {
                    name: selector.name.clone(),
                    expected: selector.target_app.clone(),
                    existing: BTreeMap::new(),
                },
            });
        }
        self.provisioned.lock().push(selector.clone());
        Ok(())
    }
}
