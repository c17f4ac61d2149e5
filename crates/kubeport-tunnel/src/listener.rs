use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::channel::Channel;
use crate::error::TunnelError;
use crate::relay::{RelayEnd, relay};
use crate::session::TunnelSession;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound local TCP socket that has not started accepting yet.
///
/// Binding is split from serving so callers can claim the port before any
/// cluster side effect happens.
pub struct LocalListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl LocalListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TunnelError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| TunnelError::Bind { addr, source })?;

        debug!(%local_addr, "local listener bound");
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections and relay each one over its own sub-stream of
    /// `session` to `remote_port`.
    ///
    /// The accept loop stops when the handle is stopped or the session closes.
    pub fn serve<C: Channel>(
        self,
        session: Arc<TunnelSession<C>>,
        remote_port: u16,
        idle_timeout: Option<Duration>,
    ) -> ListenerHandle {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let relays = TaskTracker::new();
        let local_addr = self.local_addr;

        tokio::spawn(accept_loop(
            self.inner,
            session,
            remote_port,
            idle_timeout,
            cancel.clone(),
            done.clone(),
            relays.clone(),
        ));

        ListenerHandle {
            local_addr,
            cancel,
            done,
            relays,
        }
    }
}

async fn accept_loop<C: Channel>(
    listener: TcpListener,
    session: Arc<TunnelSession<C>>,
    remote_port: u16,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
    done: CancellationToken,
    relays: TaskTracker,
) {
    let session_closed = session.close_token();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = session_closed.cancelled() => {
                info!(pod = %session.pod(), "session closed, no longer accepting");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                let span = debug_span!("relay", %peer, remote_port);
                relays.spawn(
                    relay_connection(
                        socket,
                        Arc::clone(&session),
                        remote_port,
                        idle_timeout,
                        cancel.child_token(),
                    )
                    .instrument(span),
                );
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    // Relays follow the listener down
    cancel.cancel();
    drop(listener);
    done.cancel();
}

async fn relay_connection<C: Channel>(
    socket: TcpStream,
    session: Arc<TunnelSession<C>>,
    remote_port: u16,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    let _ = socket.set_nodelay(true);

    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        stream = session.open_stream(remote_port) => stream,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            // Dropping the socket resets the client; the listener keeps going
            warn!(error = %e, "failed to open sub-stream");
            return;
        }
    };
    let stream_id = stream.id();

    match relay(socket, stream, cancel, idle_timeout).await {
        Ok(report) if report.ended_by == RelayEnd::IdleTimeout => {
            info!(%stream_id, sent = report.sent, received = report.received, "connection idle, closed");
        }
        Ok(report) => {
            debug!(
                %stream_id,
                sent = report.sent,
                received = report.received,
                ended_by = ?report.ended_by,
                "connection finished"
            );
        }
        Err(e) => debug!(%stream_id, error = %e, "relay failed"),
    }
}

/// Control over a serving listener
pub struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    done: CancellationToken,
    relays: TaskTracker,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being relayed
    pub fn active_relays(&self) -> usize {
        self.relays.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the accept loop has exited
    pub async fn stopped(&self) {
        self.done.cancelled().await;
    }

    /// Stop accepting, end every active relay and release the port; idempotent
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
        self.relays.close();
        self.relays.wait().await;
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
