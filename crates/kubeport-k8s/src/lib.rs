//! Kubernetes client for kubeport
//!
//! This crate provides Kubernetes API integration for loading contexts,
//! listing and creating deployments, provisioning services, and resolving
//! the pod a tunnel should be opened against.

mod client;
mod deployments;
mod error;
mod pods;
mod services;

pub use client::{ClusterClient, KubeClient};
pub use deployments::deployment_manifest;
pub use error::{ClusterError, Result};
pub use pods::pick_ready_pod;
pub use services::{ProvisionOutcome, service_manifest};

// Re-export types that are used in our public API
pub use kubeport_types::{
    ContextInfo, DeploymentInfo, DeploymentStatus, PodInfo, PodStatus, PortMapping,
    ServiceSelector, TargetSelector,
};
