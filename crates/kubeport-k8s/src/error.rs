use std::collections::BTreeMap;

use thiserror::Error;

/// Failures of the cluster-side operations kubeport performs
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No pod matches the target, or none of the matches is ready
    #[error("cannot resolve {target} to a ready pod: {reason}")]
    Resolution { target: String, reason: String },

    #[error("failed to create deployment '{name}'")]
    Create {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to provision service '{name}'")]
    Provision {
        name: String,
        #[source]
        source: kube::Error,
    },

    /// A service with the wanted name exists but routes somewhere else
    #[error("service '{name}' already exists with selector {existing:?}, expected app={expected}")]
    ServiceConflict {
        name: String,
        expected: String,
        existing: BTreeMap<String, String>,
    },

    #[error(transparent)]
    Api(#[from] kube::Error),
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// HTTP status carried by an API error response
fn status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    status_code(err) == Some(409)
}
