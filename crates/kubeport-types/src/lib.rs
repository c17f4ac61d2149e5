//! Shared types for kubeport
//!
//! This crate contains data structures used across multiple kubeport crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Kubernetes context information
#[derive(Clone, Debug, Serialize)]
pub struct ContextInfo {
    pub name: String,
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
    pub is_current: bool,
}

impl ContextInfo {
    pub fn new(
        name: String,
        cluster: String,
        user: String,
        namespace: Option<String>,
        is_current: bool,
    ) -> Self {
        Self {
            name,
            cluster,
            user,
            namespace,
            is_current,
        }
    }
}

/// Availability of a deployment, derived from its reported status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum DeploymentStatus {
    Available,
    Unavailable,
    #[default]
    Unknown,
}

impl DeploymentStatus {
    /// Classify a deployment from the replica counts in its status block.
    ///
    /// `available` being unreported always yields `Unknown`, whatever the
    /// other counts say. Any non-zero `unavailable` count is `Unavailable`.
    pub fn classify(replicas: i32, available: Option<i32>, unavailable: Option<i32>) -> Self {
        let Some(available) = available else {
            return Self::Unknown;
        };
        if unavailable.is_some_and(|n| n != 0) {
            return Self::Unavailable;
        }
        if available == replicas {
            return Self::Available;
        }
        Self::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Unavailable => "Unavailable",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment information
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    /// Image of the first container in the pod template
    pub image: Option<String>,
    /// Replica count reported by the deployment status (0 when unreported)
    pub replicas: i32,
    pub available_replicas: Option<i32>,
    pub unavailable_replicas: Option<i32>,
    pub status: DeploymentStatus,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DeploymentInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            image: None,
            replicas: 0,
            available_replicas: None,
            unavailable_replicas: None,
            status: DeploymentStatus::Unknown,
            labels: BTreeMap::new(),
            created_at: None,
        }
    }

    /// Recompute `status` from the replica counts
    pub fn classify(&mut self) {
        self.status = DeploymentStatus::classify(
            self.replicas,
            self.available_replicas,
            self.unavailable_replicas,
        );
    }

    /// Format replica status as "available/total"
    pub fn replica_status(&self) -> String {
        format!("{}/{}", self.available_replicas.unwrap_or(0), self.replicas)
    }
}

/// Pod information
#[derive(Clone, Debug, Serialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub status: PodStatus,
    /// Whether the pod reports the `Ready` condition as true
    pub ready: bool,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            status: PodStatus::Unknown,
            ready: false,
            node_name: None,
            pod_ip: None,
        }
    }

    /// A pod can carry port-forward traffic once it is running and ready
    pub fn is_reachable(&self) -> bool {
        self.status == PodStatus::Running && self.ready
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PodStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodStatus {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Forwarding Types
// ============================================================================

/// Label value stamped on every deployment created by kubeport
pub const DEV_ENV_LABEL: &str = "dev";

/// A local/remote port pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl PortMapping {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

/// Service object that routes to the pods of one deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSelector {
    pub name: String,
    /// Value of the `app` label the service selects on
    pub target_app: String,
    /// `local` is the service port, `remote` the container target port
    pub ports: Vec<PortMapping>,
    pub node_port: Option<u16>,
    pub service_type: String,
}

impl ServiceSelector {
    /// Selector for `<deployment>-service`, picking pods labelled `app=<deployment>`
    pub fn for_deployment(deployment: &str, ports: Vec<PortMapping>) -> Self {
        Self {
            name: Self::service_name(deployment),
            target_app: deployment.to_string(),
            ports,
            node_port: None,
            service_type: "LoadBalancer".to_string(),
        }
    }

    pub fn with_node_port(mut self, node_port: Option<u16>) -> Self {
        self.node_port = node_port;
        self
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn service_name(deployment: &str) -> String {
        format!("{}-service", deployment)
    }

    /// Labels the service selects on
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.target_app.clone())])
    }
}

/// Resource a tunnel is opened against
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetSelector {
    Pod(String),
    Service(String),
    Deployment(String),
}

impl TargetSelector {
    pub fn name(&self) -> &str {
        match self {
            Self::Pod(name) | Self::Service(name) | Self::Deployment(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pod(_) => "pod",
            Self::Service(_) => "svc",
            Self::Deployment(_) => "deploy",
        }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.name())
    }
}

impl FromStr for TargetSelector {
    type Err = String;

    /// Parse kubectl-style references: `pod/x`, `svc/x`, `deploy/x`, or a bare pod name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind, name),
            None => ("pod", s),
        };

        if name.is_empty() || name.contains('/') {
            return Err(format!("invalid target '{}'", s));
        }

        let name = name.to_string();
        match kind.to_lowercase().as_str() {
            "pod" | "pods" | "po" => Ok(Self::Pod(name)),
            "svc" | "service" | "services" => Ok(Self::Service(name)),
            "deploy" | "deployment" | "deployments" => Ok(Self::Deployment(name)),
            other => Err(format!("unsupported target kind '{}'", other)),
        }
    }
}

/// Lifecycle of a tunnel session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Resolving,
    Upgrading,
    Open,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state.
    ///
    /// Every state may fall to `Closed`; nothing leaves `Closed`.
    pub fn can_advance_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Resolving)
                | (Self::Resolving, Self::Upgrading)
                | (Self::Upgrading, Self::Open)
                | (Self::Created | Self::Resolving | Self::Upgrading | Self::Open, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
