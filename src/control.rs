//! Request/response control surface
//!
//! Every operation the front end can ask for is a [`ControlRequest`] value
//! answered by a [`ControlResponse`] or a [`ControlError`]. The controller
//! owns the running forwards, one per deployment.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use kubeport_k8s::{
    ClusterClient, ClusterError, DeploymentInfo, PortMapping, ServiceSelector, TargetSelector,
};
use kubeport_tunnel::{Connector, ForwardHandle, ForwardRequest, Forwarder, Provisioner, TunnelError};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    RequestDeployments,
    CreateDeployment { image: String, name: String },
    /// Forward to `deployment`, on `local_port` when given instead of the
    /// configured one. `target` picks the pod through something other than
    /// the provisioned service.
    PortForward {
        deployment: String,
        local_port: Option<u16>,
        target: Option<TargetSelector>,
    },
    StopForward { deployment: String },
    ListForwards,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Deployments { deployments: Vec<DeploymentInfo> },
    ForwardStarted(ForwardInfo),
    ForwardStopped { deployment: String },
    Forwards { forwards: Vec<ForwardInfo> },
}

/// A running forward as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardInfo {
    pub deployment: String,
    pub local_addr: SocketAddr,
    pub pod: String,
    pub remote_port: u16,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("deployment '{0}' is already being forwarded")]
    AlreadyForwarding(String),

    #[error("deployment '{0}' is not being forwarded")]
    NotForwarding(String),
}

/// Deployment operations the controller needs from the cluster
pub trait DeploymentStore: Send + Sync {
    fn list(&self) -> impl Future<Output = Result<Vec<DeploymentInfo>, ClusterError>> + Send;

    fn create(
        &self,
        name: &str,
        image: &str,
    ) -> impl Future<Output = Result<DeploymentInfo, ClusterError>> + Send;
}

impl DeploymentStore for ClusterClient {
    async fn list(&self) -> Result<Vec<DeploymentInfo>, ClusterError> {
        self.list_deployments().await
    }

    async fn create(&self, name: &str, image: &str) -> Result<DeploymentInfo, ClusterError> {
        self.create_deployment(name, image).await
    }
}

/// Settings applied to every forward the controller starts
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub namespace: String,
    pub local_addr: SocketAddr,
    pub remote_port: u16,
    pub service_port: u16,
    pub node_port: Option<u16>,
    pub service_type: String,
    pub idle_timeout: Option<Duration>,
}

impl ForwardSettings {
    pub fn from_config(config: &Config) -> Self {
        let forward = &config.forward;
        Self {
            namespace: config.namespace.clone(),
            local_addr: forward.local_addr(),
            remote_port: forward.remote_port,
            service_port: forward.service_port,
            node_port: forward.node_port,
            service_type: forward.service_type.clone(),
            idle_timeout: forward.idle_timeout(),
        }
    }

    fn request(
        &self,
        deployment: &str,
        local_port: Option<u16>,
        target: Option<TargetSelector>,
    ) -> ForwardRequest {
        let mut local_addr = self.local_addr;
        if let Some(port) = local_port {
            local_addr.set_port(port);
        }

        let service = ServiceSelector::for_deployment(
            deployment,
            vec![PortMapping::new(self.service_port, self.remote_port)],
        )
        .with_node_port(self.node_port)
        .with_service_type(self.service_type.clone());

        ForwardRequest::new(&self.namespace, deployment, local_addr, self.remote_port)
            .with_service(service)
            .with_target(target)
            .with_idle_timeout(self.idle_timeout)
    }
}

pub struct Controller<D, P, K: Connector> {
    store: D,
    forwarder: Forwarder<P, K>,
    settings: ForwardSettings,
    forwards: HashMap<String, ForwardHandle<K::Channel>>,
}

impl<D, P, K> Controller<D, P, K>
where
    D: DeploymentStore,
    P: Provisioner,
    K: Connector,
{
    pub fn new(store: D, provisioner: P, connector: K, settings: ForwardSettings) -> Self {
        Self {
            store,
            forwarder: Forwarder::new(provisioner, connector),
            settings,
            forwards: HashMap::new(),
        }
    }

    pub async fn handle(&mut self, request: ControlRequest) -> Result<ControlResponse, ControlError> {
        match request {
            ControlRequest::RequestDeployments => self.deployments().await,
            ControlRequest::CreateDeployment { image, name } => {
                self.create_deployment(&name, &image).await
            }
            ControlRequest::PortForward {
                deployment,
                local_port,
                target,
            } => self.port_forward(&deployment, local_port, target).await,
            ControlRequest::StopForward { deployment } => self.stop_forward(&deployment).await,
            ControlRequest::ListForwards => Ok(ControlResponse::Forwards {
                forwards: self.list_forwards(),
            }),
        }
    }

    async fn deployments(&self) -> Result<ControlResponse, ControlError> {
        let deployments = self.store.list().await?;
        Ok(ControlResponse::Deployments { deployments })
    }

    /// Create, then re-fetch so the caller sees the cluster's view
    async fn create_deployment(&self, name: &str, image: &str) -> Result<ControlResponse, ControlError> {
        if let Err(e) = self.store.create(name, image).await {
            warn!(deployment = name, image, error = %e, "deployment not created");
            return Err(e.into());
        }
        info!(deployment = name, image, "deployment created");
        self.deployments().await
    }

    async fn port_forward(
        &mut self,
        deployment: &str,
        local_port: Option<u16>,
        target: Option<TargetSelector>,
    ) -> Result<ControlResponse, ControlError> {
        if let Some(existing) = self.forwards.get(deployment) {
            if existing.is_running() {
                return Err(ControlError::AlreadyForwarding(deployment.to_string()));
            }
            // The previous forward died with its pod; clear it out first
            if let Some(stale) = self.forwards.remove(deployment) {
                stale.stop().await;
            }
        }

        let request = self.settings.request(deployment, local_port, target);
        let handle = self.forwarder.start(&request).await?;
        let forward = forward_info(&handle);
        self.forwards.insert(deployment.to_string(), handle);

        Ok(ControlResponse::ForwardStarted(forward))
    }

    async fn stop_forward(&mut self, deployment: &str) -> Result<ControlResponse, ControlError> {
        let handle = self
            .forwards
            .remove(deployment)
            .ok_or_else(|| ControlError::NotForwarding(deployment.to_string()))?;
        handle.stop().await;

        Ok(ControlResponse::ForwardStopped {
            deployment: deployment.to_string(),
        })
    }

    /// Running forwards, sorted by deployment
    pub fn list_forwards(&self) -> Vec<ForwardInfo> {
        let mut forwards: Vec<ForwardInfo> = self
            .forwards
            .values()
            .filter(|h| h.is_running())
            .map(forward_info)
            .collect();
        forwards.sort_by(|a, b| a.deployment.cmp(&b.deployment));
        forwards
    }

    pub fn forward(&self, deployment: &str) -> Option<&ForwardHandle<K::Channel>> {
        self.forwards.get(deployment)
    }

    /// Stop every forward
    pub async fn shutdown(&mut self) {
        for (_, handle) in self.forwards.drain() {
            handle.stop().await;
        }
    }
}

fn forward_info<C: kubeport_tunnel::Channel>(handle: &ForwardHandle<C>) -> ForwardInfo {
    ForwardInfo {
        deployment: handle.deployment().to_string(),
        local_addr: handle.local_addr(),
        pod: handle.pod().to_string(),
        remote_port: handle.remote_port(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeport_k8s::DeploymentStatus;
    use kubeport_tunnel::testing::{MemoryConnector, MemoryProvisioner};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Store that behaves like a cluster which reports status straight away
    #[derive(Clone, Default)]
    struct FakeStore {
        deployments: Arc<Mutex<Vec<DeploymentInfo>>>,
        reject_creates: bool,
    }

    impl DeploymentStore for FakeStore {
        async fn list(&self) -> Result<Vec<DeploymentInfo>, ClusterError> {
            Ok(self.deployments.lock().clone())
        }

        async fn create(&self, name: &str, image: &str) -> Result<DeploymentInfo, ClusterError> {
            if self.reject_creates {
                return Err(ClusterError::Resolution {
                    target: name.to_string(),
                    reason: "quota exceeded".to_string(),
                });
            }
            let mut info = DeploymentInfo::new(name.to_string(), "default".to_string());
            info.image = Some(image.to_string());
            info.replicas = 1;
            info.available_replicas = Some(1);
            info.classify();
            self.deployments.lock().push(info.clone());
            Ok(info)
        }
    }

    fn settings() -> ForwardSettings {
        let mut config = Config::default();
        config.forward.local_port = 0;
        ForwardSettings::from_config(&config)
    }

    fn controller(
        store: FakeStore,
    ) -> (
        Controller<FakeStore, MemoryProvisioner, MemoryConnector>,
        MemoryProvisioner,
        kubeport_tunnel::testing::RemoteEnd,
    ) {
        let (connector, remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let provisioner = MemoryProvisioner::new();
        let controller = Controller::new(store, provisioner.clone(), connector, settings());
        (controller, provisioner, remote)
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let (mut controller, _, _remote) = controller(FakeStore::default());

        let response = controller
            .handle(ControlRequest::CreateDeployment {
                image: "repo/app:tag".to_string(),
                name: "foo".to_string(),
            })
            .await
            .unwrap();

        let ControlResponse::Deployments { deployments } = response else {
            panic!("expected deployments, got {:?}", response);
        };
        assert_eq!(deployments.len(), 1);
        let foo = &deployments[0];
        assert_eq!(foo.name, "foo");
        assert_eq!(foo.image.as_deref(), Some("repo/app:tag"));
        assert_eq!(foo.replicas, 1);
        assert_eq!(foo.status, DeploymentStatus::Available);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_list_unchanged() {
        let store = FakeStore {
            reject_creates: true,
            ..FakeStore::default()
        };
        let (mut controller, _, _remote) = controller(store);

        let result = controller
            .handle(ControlRequest::CreateDeployment {
                image: "nginx".to_string(),
                name: "foo".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ControlError::Cluster(_))));

        let response = controller.handle(ControlRequest::RequestDeployments).await.unwrap();
        assert!(matches!(response, ControlResponse::Deployments { deployments } if deployments.is_empty()));
    }

    #[tokio::test]
    async fn test_forward_lifecycle() {
        let (mut controller, provisioner, remote) = controller(FakeStore::default());
        let _echo = remote.spawn_echo();

        let response = controller
            .handle(ControlRequest::PortForward {
                deployment: "web".to_string(),
                local_port: None,
                target: None,
            })
            .await
            .unwrap();
        let ControlResponse::ForwardStarted(info) = response else {
            panic!("expected a started forward, got {:?}", response);
        };
        assert_eq!(info.pod, "web-0");
        assert_eq!(info.remote_port, 3000);

        let service = &provisioner.provisioned()[0];
        assert_eq!(service.name, "web-service");
        assert_eq!(service.ports, vec![PortMapping::new(3000, 3000)]);
        assert_eq!(service.node_port, Some(30008));

        let mut client = TcpStream::connect(info.local_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(controller.list_forwards(), vec![info.clone()]);

        let again = controller
            .handle(ControlRequest::PortForward {
                deployment: "web".to_string(),
                local_port: None,
                target: None,
            })
            .await;
        assert!(matches!(again, Err(ControlError::AlreadyForwarding(_))));

        controller
            .handle(ControlRequest::StopForward {
                deployment: "web".to_string(),
            })
            .await
            .unwrap();
        assert!(controller.list_forwards().is_empty());

        let missing = controller
            .handle(ControlRequest::StopForward {
                deployment: "web".to_string(),
            })
            .await;
        assert!(matches!(missing, Err(ControlError::NotForwarding(_))));
    }

    #[tokio::test]
    async fn test_forward_to_explicit_pod_target() {
        let (connector, remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-0", "web-0");
        let _echo = remote.spawn_echo();
        let provisioner = MemoryProvisioner::new();
        let mut controller =
            Controller::new(FakeStore::default(), provisioner.clone(), connector, settings());

        let response = controller
            .handle(ControlRequest::PortForward {
                deployment: "web".to_string(),
                local_port: None,
                target: Some("pod/web-0".parse().unwrap()),
            })
            .await
            .unwrap();
        let ControlResponse::ForwardStarted(info) = response else {
            panic!("expected a started forward, got {:?}", response);
        };
        assert_eq!(info.pod, "web-0");

        // The service is still provisioned for the deployment
        assert_eq!(provisioner.provisioned()[0].name, "web-service");

        let handle = controller.forward("web").unwrap();
        assert_eq!(handle.session().target(), &TargetSelector::Pod("web-0".to_string()));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_forward_on_taken_port_is_bind_error() {
        let (mut controller, provisioner, _remote) = controller(FakeStore::default());

        let ControlResponse::ForwardStarted(first) = controller
            .handle(ControlRequest::PortForward {
                deployment: "web".to_string(),
                local_port: None,
                target: None,
            })
            .await
            .unwrap()
        else {
            panic!("expected a started forward");
        };

        let result = controller
            .handle(ControlRequest::PortForward {
                deployment: "api".to_string(),
                local_port: Some(first.local_addr.port()),
                target: None,
            })
            .await;

        assert!(matches!(
            result,
            Err(ControlError::Tunnel(TunnelError::Bind { .. }))
        ));
        assert_eq!(provisioner.provisioned().len(), 1);

        controller.shutdown().await;
        assert!(controller.forward("web").is_none());
    }
}
