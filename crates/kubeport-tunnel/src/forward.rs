//! Forward a local port to a deployment.
//!
//! A forward is the composition of the pieces in this crate: bind the local
//! port, make sure a service fronts the deployment, open a session to one of
//! its pods and serve the listener over that session.

use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use kubeport_types::{PortMapping, ServiceSelector, TargetSelector};

use crate::channel::{Channel, Connector};
use crate::error::TunnelError;
use crate::listener::{ListenerHandle, LocalListener};
use crate::session::TunnelSession;

/// Makes sure a service routes to the deployment before tunnelling
pub trait Provisioner: Send + Sync {
    fn ensure_service(
        &self,
        selector: &ServiceSelector,
    ) -> impl Future<Output = Result<(), TunnelError>> + Send;
}

/// Everything needed to start one forward
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    pub namespace: String,
    pub deployment: String,
    pub local_addr: SocketAddr,
    pub remote_port: u16,
    pub service: ServiceSelector,
    /// Resolve the tunnel through this instead of the provisioned service
    pub target: Option<TargetSelector>,
    pub idle_timeout: Option<Duration>,
}

impl ForwardRequest {
    /// Forward `local_addr` to `remote_port` on `deployment`, fronted by the
    /// default `<deployment>-service` exposing `remote_port`
    pub fn new(namespace: &str, deployment: &str, local_addr: SocketAddr, remote_port: u16) -> Self {
        let service = ServiceSelector::for_deployment(
            deployment,
            vec![PortMapping::new(remote_port, remote_port)],
        );
        Self {
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
            local_addr,
            remote_port,
            service,
            target: None,
            idle_timeout: None,
        }
    }

    pub fn with_service(mut self, service: ServiceSelector) -> Self {
        self.service = service;
        self
    }

    pub fn with_target(mut self, target: Option<TargetSelector>) -> Self {
        self.target = target;
        self
    }

    /// Close connections that move no bytes for `timeout`
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// What the tunnel resolves to a pod, the provisioned service unless overridden
    pub fn target(&self) -> TargetSelector {
        self.target
            .clone()
            .unwrap_or_else(|| TargetSelector::Service(self.service.name.clone()))
    }
}

/// Starts forwards against one cluster
pub struct Forwarder<P, K> {
    provisioner: P,
    connector: K,
}

impl<P, K> Forwarder<P, K>
where
    P: Provisioner,
    K: Connector,
{
    pub fn new(provisioner: P, connector: K) -> Self {
        Self {
            provisioner,
            connector,
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Start forwarding.
    ///
    /// The local port is claimed first: if it is taken the call fails with
    /// `Bind` before anything is created in the cluster. Any later failure
    /// releases the port again.
    #[instrument(skip(self, request), fields(deployment = %request.deployment, local = %request.local_addr))]
    pub async fn start(&self, request: &ForwardRequest) -> Result<ForwardHandle<K::Channel>, TunnelError> {
        let listener = LocalListener::bind(request.local_addr).await?;

        self.provisioner.ensure_service(&request.service).await?;

        let target = request.target();
        let session = TunnelSession::open(
            &self.connector,
            &request.namespace,
            &target,
            BTreeSet::from([request.remote_port]),
        )
        .await?;
        let session = Arc::new(session);

        let local_addr = listener.local_addr();
        let listener = listener.serve(Arc::clone(&session), request.remote_port, request.idle_timeout);

        info!(
            pod = %session.pod(),
            %local_addr,
            remote_port = request.remote_port,
            "forwarding"
        );

        Ok(ForwardHandle {
            deployment: request.deployment.clone(),
            remote_port: request.remote_port,
            listener,
            session,
        })
    }
}

/// A running forward
pub struct ForwardHandle<C: Channel> {
    deployment: String,
    remote_port: u16,
    listener: ListenerHandle,
    session: Arc<TunnelSession<C>>,
}

impl<C: Channel> ForwardHandle<C> {
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn pod(&self) -> &str {
        self.session.pod()
    }

    pub fn session(&self) -> &Arc<TunnelSession<C>> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        !self.listener.is_stopped() && !self.session.is_closed()
    }

    /// Resolves when the forward ends on its own, e.g. the pod went away
    pub async fn wait(&self) {
        self.listener.stopped().await;
    }

    /// Stop the listener, end its relays and close the session; idempotent
    pub async fn stop(&self) {
        self.listener.stop().await;
        self.session.close().await;
        info!(deployment = %self.deployment, "forward stopped");
    }
}
