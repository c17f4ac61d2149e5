//! Seams between the tunnel session and the transport that carries it

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use kubeport_types::TargetSelector;

use crate::error::TunnelError;

/// Correlation id of one sub-stream within a session.
///
/// Plays the role of the port-forward `requestID` that pairs a data stream
/// with its error stream on the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte stream a relay can pump
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Resolves targets and upgrades connections into streaming channels
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    /// Find the pod a target currently routes to
    fn resolve(
        &self,
        namespace: &str,
        target: &TargetSelector,
    ) -> impl Future<Output = Result<String, TunnelError>> + Send;

    /// Open the multiplexed channel to `pod` for the given remote ports
    fn upgrade(
        &self,
        namespace: &str,
        pod: &str,
        remote_ports: &BTreeSet<u16>,
    ) -> impl Future<Output = Result<Self::Channel, TunnelError>> + Send;
}

/// An upgraded port-forward channel to one pod
pub trait Channel: Send + Sync + 'static {
    type Stream: TunnelIo;

    /// Open a fresh sub-stream to `remote_port`, tagged with `id`
    fn open_stream(
        &self,
        id: StreamId,
        remote_port: u16,
    ) -> impl Future<Output = Result<Self::Stream, TunnelError>> + Send;

    /// Resolves with a reason once the channel has failed underneath the session
    fn closed(&self) -> impl Future<Output = String> + Send;

    /// Tear the channel down; pending and future sub-streams stop working
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}
