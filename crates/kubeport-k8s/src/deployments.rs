use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Api;
use kube::api::{ListParams, PostParams};
use tracing::{debug, info};

use kubeport_types::{DEV_ENV_LABEL, DeploymentInfo};

use crate::client::ClusterClient;
use crate::error::{ClusterError, Result};

impl ClusterClient {
    /// Fetch all deployments in the client's namespace
    pub async fn list_deployments(&self) -> Result<Vec<DeploymentInfo>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = deployments.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .map(|d| deployment_to_info(d, &self.namespace))
            .collect())
    }

    /// Submit a single-replica deployment running `image`.
    ///
    /// Never retried: a name collision or rejection comes back as
    /// `ClusterError::Create` and the caller re-lists to see the real state.
    pub async fn create_deployment(&self, name: &str, image: &str) -> Result<DeploymentInfo> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let manifest = deployment_manifest(name, image);

        match deployments.create(&PostParams::default(), &manifest).await {
            Ok(created) => {
                info!(deployment = name, image, namespace = %self.namespace, "deployment created");
                Ok(deployment_to_info(created, &self.namespace))
            }
            Err(source) => {
                debug!(deployment = name, error = %source, "deployment create rejected");
                Err(ClusterError::Create {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

/// Labels shared by the selector and pod template of created deployments
fn dev_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), name.to_string()),
        ("env".to_string(), DEV_ENV_LABEL.to_string()),
    ])
}

/// Build the manifest for a one-container, one-replica deployment
pub fn deployment_manifest(name: &str, image: &str) -> Deployment {
    let labels = dev_labels(name);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Convert a k8s Deployment to DeploymentInfo
pub(crate) fn deployment_to_info(deploy: Deployment, namespace: &str) -> DeploymentInfo {
    let name = deploy.metadata.name.unwrap_or_default();
    let mut info = DeploymentInfo::new(name, namespace.to_string());

    info.created_at = deploy.metadata.creation_timestamp.map(|t| t.0);

    if let Some(labels) = deploy.metadata.labels {
        info.labels = labels;
    }

    info.image = deploy
        .spec
        .and_then(|spec| spec.template.spec)
        .and_then(|pod| pod.containers.into_iter().next())
        .and_then(|container| container.image);

    if let Some(status) = deploy.status {
        info.replicas = status.replicas.unwrap_or(0);
        info.available_replicas = status.available_replicas;
        info.unavailable_replicas = status.unavailable_replicas;
    }

    info.classify();
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus as K8sDeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kubeport_types::DeploymentStatus;

    fn reported(replicas: i32, available: Option<i32>, unavailable: Option<i32>) -> Deployment {
        let mut deploy = deployment_manifest("foo", "repo/app:tag");
        deploy.status = Some(K8sDeploymentStatus {
            replicas: Some(replicas),
            available_replicas: available,
            unavailable_replicas: unavailable,
            ..Default::default()
        });
        deploy
    }

    #[test]
    fn test_manifest_shape() {
        let deploy = deployment_manifest("foo", "repo/app:tag");
        let spec = deploy.spec.unwrap();

        assert_eq!(spec.replicas, Some(1));
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("foo"));
        assert_eq!(selector.get("env").map(String::as_str), Some("dev"));

        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(template_labels, selector);

        let containers = spec.template.spec.unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "foo");
        assert_eq!(containers[0].image.as_deref(), Some("repo/app:tag"));
    }

    #[test]
    fn test_info_before_status_is_reported() {
        let info = deployment_to_info(deployment_manifest("foo", "repo/app:tag"), "default");

        assert_eq!(info.name, "foo");
        assert_eq!(info.image.as_deref(), Some("repo/app:tag"));
        assert_eq!(info.replicas, 0);
        assert_eq!(info.status, DeploymentStatus::Unknown);
    }

    #[test]
    fn test_info_classifies_status() {
        let info = deployment_to_info(reported(1, Some(1), None), "default");
        assert_eq!(info.replicas, 1);
        assert_eq!(info.status, DeploymentStatus::Available);

        let info = deployment_to_info(reported(2, Some(1), Some(1)), "default");
        assert_eq!(info.status, DeploymentStatus::Unavailable);

        let info = deployment_to_info(reported(1, None, None), "default");
        assert_eq!(info.status, DeploymentStatus::Unknown);
    }

    #[test]
    fn test_info_keeps_creation_timestamp() {
        let created = chrono::Utc::now();
        let mut deploy = reported(1, Some(1), None);
        deploy.metadata.creation_timestamp = Some(Time(created));

        let info = deployment_to_info(deploy, "default");
        assert_eq!(info.created_at, Some(created));
    }
}
