use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use kubeport_types::{PodInfo, PodStatus, TargetSelector};

use crate::client::ClusterClient;
use crate::error::{ClusterError, Result};

impl ClusterClient {
    /// Resolve a target to one running, ready pod.
    ///
    /// Services and deployments are followed through their label selectors;
    /// a pod target must itself be ready.
    pub async fn resolve_ready_pod(&self, target: &TargetSelector) -> Result<PodInfo> {
        let unresolved = |reason: String| ClusterError::Resolution {
            target: target.to_string(),
            reason,
        };

        let labels = match target {
            TargetSelector::Pod(name) => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                let pod = pods
                    .get_opt(name)
                    .await?
                    .ok_or_else(|| unresolved("pod not found".to_string()))?;
                let info = pod_to_info(pod, &self.namespace);
                if !info.is_reachable() {
                    return Err(unresolved(format!("pod is {:?} and not ready", info.status)));
                }
                return Ok(info);
            }
            TargetSelector::Service(name) => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
                services
                    .get_opt(name)
                    .await?
                    .ok_or_else(|| unresolved("service not found".to_string()))?
                    .spec
                    .and_then(|spec| spec.selector)
                    .unwrap_or_default()
            }
            TargetSelector::Deployment(name) => {
                let deployments: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &self.namespace);
                deployments
                    .get_opt(name)
                    .await?
                    .ok_or_else(|| unresolved("deployment not found".to_string()))?
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
                    .unwrap_or_default()
            }
        };

        if labels.is_empty() {
            return Err(unresolved("target has no label selector".to_string()));
        }

        let pods = self.pods_matching(&labels).await?;
        debug!(target = %target, candidates = pods.len(), "resolving target pod");

        if pods.is_empty() {
            return Err(unresolved(format!(
                "no pods match {}",
                label_selector(&labels)
            )));
        }

        pick_ready_pod(pods).ok_or_else(|| unresolved("no matching pod is ready".to_string()))
    }

    /// Fetch pods carrying all of the given labels
    pub async fn pods_matching(&self, labels: &BTreeMap<String, String>) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector(labels)))
            .await?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| pod_to_info(pod, &self.namespace))
            .collect())
    }
}

/// Build a `k=v,k=v` label selector
fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pick the first reachable pod by name, so repeated resolutions agree
pub fn pick_ready_pod(mut pods: Vec<PodInfo>) -> Option<PodInfo> {
    pods.sort_by(|a, b| a.name.cmp(&b.name));
    pods.into_iter().find(PodInfo::is_reachable)
}

/// Convert a k8s Pod to PodInfo
fn pod_to_info(pod: Pod, namespace: &str) -> PodInfo {
    let name = pod.metadata.name.unwrap_or_default();
    let mut info = PodInfo::new(name, namespace.to_string());

    if let Some(spec) = &pod.spec {
        info.node_name = spec.node_name.clone();
    }

    if let Some(status) = pod.status {
        info.pod_ip = status.pod_ip;
        info.status = status
            .phase
            .as_deref()
            .map(PodStatus::from)
            .unwrap_or(PodStatus::Unknown);
        info.ready = status
            .conditions
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
    }

    info
}
