use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::PostParams;
use tracing::{info, warn};

use kubeport_types::ServiceSelector;

use crate::client::ClusterClient;
use crate::error::{ClusterError, Result, is_conflict};

/// What `ensure_service` found on the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    /// A service with the same name and a matching selector was already there
    AlreadyExists,
}

impl ClusterClient {
    /// Make sure a service routing to the selector's target app exists.
    ///
    /// Creation is attempted once. An "already exists" conflict is accepted
    /// only when the existing service selects the same app; a service with a
    /// different selector is reported as `ServiceConflict` rather than reused.
    pub async fn ensure_service(&self, selector: &ServiceSelector) -> Result<ProvisionOutcome> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let manifest = service_manifest(selector);

        match services.create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                info!(service = %selector.name, app = %selector.target_app, "service created");
                Ok(ProvisionOutcome::Created)
            }
            Err(err) if is_conflict(&err) => {
                let existing =
                    services
                        .get(&selector.name)
                        .await
                        .map_err(|source| ClusterError::Provision {
                            name: selector.name.clone(),
                            source,
                        })?;
                check_existing(selector, &existing)?;
                info!(service = %selector.name, "service already exists, reusing it");
                Ok(ProvisionOutcome::AlreadyExists)
            }
            Err(source) => {
                warn!(service = %selector.name, error = %source, "service create rejected");
                Err(ClusterError::Provision {
                    name: selector.name.clone(),
                    source,
                })
            }
        }
    }
}

/// Build the service manifest for a selector
pub fn service_manifest(selector: &ServiceSelector) -> Service {
    // Node ports are only meaningful for NodePort and LoadBalancer services
    let node_port = selector
        .node_port
        .filter(|_| selector.service_type != "ClusterIP");

    let ports = selector
        .ports
        .iter()
        .enumerate()
        .map(|(i, mapping)| ServicePort {
            name: Some(format!("tcp-{}", mapping.local)),
            port: i32::from(mapping.local),
            target_port: Some(IntOrString::Int(i32::from(mapping.remote))),
            node_port: if i == 0 { node_port.map(i32::from) } else { None },
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: ObjectMeta {
            name: Some(selector.name.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(selector.service_type.clone()),
            selector: Some(selector.selector_labels()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Accept an existing service only if it routes to the same app
fn check_existing(selector: &ServiceSelector, existing: &Service) -> Result<()> {
    let existing_selector = existing
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.clone())
        .unwrap_or_default();

    if existing_selector.get("app") == Some(&selector.target_app) {
        return Ok(());
    }

    Err(ClusterError::ServiceConflict {
        name: selector.name.clone(),
        expected: selector.target_app.clone(),
        existing: existing_selector,
    })
}
