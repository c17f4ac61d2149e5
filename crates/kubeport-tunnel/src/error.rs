use std::fmt;
use std::io;
use std::net::SocketAddr;

use kubeport_k8s::ClusterError;
use thiserror::Error;

/// Direction of one relay leg
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalToRemote => f.write_str("local->remote"),
            Self::RemoteToLocal => f.write_str("remote->local"),
        }
    }
}

/// Errors raised while opening or running a tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The local port is taken or the address is unusable
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot resolve {target} to a ready pod: {reason}")]
    Resolution { target: String, reason: String },

    /// The streaming upgrade was refused or never completed
    #[error("failed to open port-forward channel to pod {pod}: {reason}")]
    Upgrade { pod: String, reason: String },

    #[error("relay failed on {direction}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("tunnel session is closed")]
    Closed,

    #[error("remote port {0} is not forwarded by this session")]
    PortNotForwarded(u16),

    #[error("failed to provision service for {target}")]
    Provision {
        target: String,
        #[source]
        source: ClusterError,
    },
}

impl TunnelError {
    /// Build an `Upgrade` error from any displayable cause
    pub fn upgrade(pod: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Upgrade {
            pod: pod.into(),
            reason: reason.to_string(),
        }
    }

    /// I/O error handed to readers and writers of a closed sub-stream
    pub(crate) fn closed_io() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, TunnelError::Closed)
    }
}

/// Map resolution failures from the cluster client onto the tunnel taxonomy
pub(crate) fn resolution_error(target: &str, err: ClusterError) -> TunnelError {
    match err {
        ClusterError::Resolution { target, reason } => TunnelError::Resolution { target, reason },
        other => TunnelError::Resolution {
            target: target.to_string(),
            reason: other.to_string(),
        },
    }
}
