//! Port-forward tunnel for kubeport
//!
//! A [`TunnelSession`] owns one upgraded channel to a pod and leases a fresh
//! sub-stream to every local connection. [`LocalListener`] accepts those
//! connections and [`relay`] pumps bytes between the two ends. [`Forwarder`]
//! ties the pieces to a deployment.

mod channel;
mod error;
mod forward;
mod kube_channel;
mod listener;
mod relay;
mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::{Channel, Connector, StreamId, TunnelIo};
pub use error::{Direction, TunnelError};
pub use forward::{ForwardHandle, ForwardRequest, Forwarder, Provisioner};
pub use kube_channel::{KubeChannel, KubeConnector};
pub use listener::{ListenerHandle, LocalListener};
pub use relay::{RelayEnd, RelayReport, relay};
pub use session::{TunnelSession, TunnelStream};
