use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use kubeport_types::{SessionState, TargetSelector};

use crate::channel::{Channel, Connector, StreamId};
use crate::error::TunnelError;

/// One upgraded port-forward channel to a single pod.
///
/// Relays lease sub-streams through [`TunnelSession::open_stream`]; closing
/// the session (or dropping it) cancels every lease.
pub struct TunnelSession<C: Channel> {
    namespace: String,
    target: TargetSelector,
    pod: String,
    remote_ports: BTreeSet<u16>,
    channel: Arc<C>,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    next_stream_id: AtomicU64,
    open_streams: Arc<AtomicUsize>,
    tasks: TaskTracker,
}

impl<C: Channel> TunnelSession<C> {
    /// Resolve `target` to a pod and upgrade a channel to it.
    ///
    /// Fails with `Resolution` when no ready pod backs the target and with
    /// `Upgrade` when the channel cannot be opened. No retries.
    pub async fn open<K>(
        connector: &K,
        namespace: &str,
        target: &TargetSelector,
        remote_ports: BTreeSet<u16>,
    ) -> Result<Self, TunnelError>
    where
        K: Connector<Channel = C>,
    {
        let (state, _) = watch::channel(SessionState::Created);

        if remote_ports.is_empty() {
            advance(&state, SessionState::Closed);
            return Err(TunnelError::upgrade(target.name(), "no remote ports requested"));
        }

        advance(&state, SessionState::Resolving);
        let pod = match connector.resolve(namespace, target).await {
            Ok(pod) => pod,
            Err(err) => {
                advance(&state, SessionState::Closed);
                return Err(err);
            }
        };

        advance(&state, SessionState::Upgrading);
        let channel = match connector.upgrade(namespace, &pod, &remote_ports).await {
            Ok(channel) => channel,
            Err(err) => {
                advance(&state, SessionState::Closed);
                return Err(err);
            }
        };

        advance(&state, SessionState::Open);
        info!(namespace, target = %target, pod = %pod, ports = ?remote_ports, "tunnel session open");

        let session = Self {
            namespace: namespace.to_string(),
            target: target.clone(),
            pod,
            remote_ports,
            channel: Arc::new(channel),
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            next_stream_id: AtomicU64::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
            tasks: TaskTracker::new(),
        };
        session.spawn_bookkeeping();

        Ok(session)
    }

    /// Watch the channel for failure and finish teardown once cancelled
    fn spawn_bookkeeping(&self) {
        let channel = Arc::clone(&self.channel);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let pod = self.pod.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                reason = channel.closed() => {
                    warn!(pod = %pod, reason = %reason, "port-forward channel failed, closing session");
                    cancel.cancel();
                }
            }

            channel.shutdown().await;
            advance(&state, SessionState::Closed);
            debug!(pod = %pod, "tunnel session closed");
        });
        self.tasks.close();
    }

    /// Lease a fresh sub-stream to `remote_port`.
    ///
    /// Safe to call from many relays at once; every call gets its own
    /// correlation id.
    pub async fn open_stream(&self, remote_port: u16) -> Result<TunnelStream<C::Stream>, TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        if !self.remote_ports.contains(&remote_port) {
            return Err(TunnelError::PortNotForwarded(remote_port));
        }

        let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed));

        let inner = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TunnelError::Closed),
            stream = self.channel.open_stream(id, remote_port) => stream?,
        };

        debug!(pod = %self.pod, stream_id = %id, remote_port, "sub-stream opened");

        Ok(TunnelStream::new(
            id,
            remote_port,
            inner,
            self.cancel.child_token(),
            Arc::clone(&self.open_streams),
        ))
    }

    /// Tear down the channel; idempotent.
    ///
    /// Every leased stream fails with `NotConnected`, including reads and
    /// writes already waiting on the channel.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.wait().await;
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn target(&self) -> &TargetSelector {
        &self.target
    }

    /// Pod the channel is bound to
    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub fn remote_ports(&self) -> &BTreeSet<u16> {
        &self.remote_ports
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Number of sub-streams currently leased out
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the session closes, for tasks bound to it
    pub fn close_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

impl<C: Channel> Drop for TunnelSession<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Move to `next` if the state machine allows it
fn advance(state: &watch::Sender<SessionState>, next: SessionState) {
    state.send_if_modified(|current| {
        if !current.can_advance_to(next) {
            return false;
        }
        debug!(from = %current, to = %next, "session state");
        *current = next;
        true
    });
}

/// A sub-stream leased from a [`TunnelSession`].
///
/// Reads and writes already waiting on the inner stream are woken when the
/// session closes and fail with `NotConnected`.
pub struct TunnelStream<S> {
    id: StreamId,
    remote_port: u16,
    inner: S,
    closed: CancellationToken,
    closing: Pin<Box<WaitForCancellationFutureOwned>>,
    open_streams: Arc<AtomicUsize>,
}

impl<S> TunnelStream<S> {
    fn new(
        id: StreamId,
        remote_port: u16,
        inner: S,
        closed: CancellationToken,
        open_streams: Arc<AtomicUsize>,
    ) -> Self {
        open_streams.fetch_add(1, Ordering::SeqCst);
        let closing = Box::pin(closed.clone().cancelled_owned());
        Self {
            id,
            remote_port,
            inner,
            closed,
            closing,
            open_streams,
        }
    }

    /// Whether the session has closed, registering `cx` to be woken when it does
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.closed.is_cancelled() || self.closing.as_mut().poll(cx).is_ready()
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<S> Drop for TunnelStream<S> {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(TunnelError::closed_io()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(TunnelError::closed_io()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(TunnelError::closed_io()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Nothing left to shut down once the session is gone
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::relay;
    use crate::testing::MemoryConnector;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn web_target() -> TargetSelector {
        TargetSelector::Service("web-service".to_string())
    }

    #[tokio::test]
    async fn test_open_unknown_target_is_resolution_error() {
        let (connector, _remote) = MemoryConnector::new();
        let result = TunnelSession::open(
            &connector,
            "default",
            &TargetSelector::Service("missing".to_string()),
            BTreeSet::from([3000]),
        )
        .await;

        assert!(matches!(result, Err(TunnelError::Resolution { .. })));
        assert_eq!(connector.upgrades(), 0);
    }

    #[tokio::test]
    async fn test_rejected_upgrade_is_upgrade_error() {
        let (connector, _remote) = MemoryConnector::new();
        let connector = connector
            .with_pod("web-service", "web-0")
            .rejecting_upgrades("forbidden");

        let result =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000])).await;

        match result {
            Err(TunnelError::Upgrade { pod, reason }) => {
                assert_eq!(pod, "web-0");
                assert_eq!(reason, "forbidden");
            }
            other => panic!("expected upgrade error, got {:?}", other.map(|s| s.state())),
        }
    }

    #[tokio::test]
    async fn test_open_session_state_and_ids() {
        let (connector, mut remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");

        let session =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.pod(), "web-0");

        let first = session.open_stream(3000).await.unwrap();
        let second = session.open_stream(3000).await.unwrap();
        assert!(first.id() < second.id());
        assert_eq!(session.open_streams(), 2);

        let far = remote.accept().await.unwrap();
        assert_eq!(far.id, first.id());
        assert_eq!(far.remote_port, 3000);

        drop(first);
        drop(second);
        assert_eq!(session.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_unrequested_port_is_rejected() {
        let (connector, _remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let session =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap();

        assert!(matches!(
            session.open_stream(8080).await,
            Err(TunnelError::PortNotForwarded(8080))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_open_stream_ids_are_unique() {
        let (connector, _remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let session = Arc::new(
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                session.open_stream(3000).await.map(|s| s.id())
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_close_fails_open_streams() {
        let (connector, mut remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let session =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap();

        let mut stream = session.open_stream(3000).await.unwrap();
        let mut far = remote.accept().await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(stream.is_closed());

        let err = stream.write_all(b"pong").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(matches!(
            session.open_stream(3000).await,
            Err(TunnelError::Closed)
        ));

        // Closing twice is harmless
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (connector, mut remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let session =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap();

        let mut stream = session.open_stream(3000).await.unwrap();
        let _far = remote.accept().await.unwrap();

        // The far end never writes, so the read parks on the channel
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            stream.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        session.close().await;

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("pending read was not woken by close")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert_eq!(session.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_relay_with_its_own_token() {
        let (connector, mut remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let session =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap();

        let stream = session.open_stream(3000).await.unwrap();
        let _far = remote.accept().await.unwrap();
        let (local, _client) = tokio::io::duplex(64);

        // Neither side sends anything; only the session close can end this relay
        let relaying = tokio::spawn(relay(local, stream, CancellationToken::new(), None));
        tokio::task::yield_now().await;

        session.close().await;

        let result = tokio::time::timeout(Duration::from_secs(2), relaying)
            .await
            .expect("relay kept running after the session closed")
            .unwrap();
        assert!(matches!(result, Err(TunnelError::Relay { .. })));
    }

    #[tokio::test]
    async fn test_channel_failure_closes_session() {
        let (connector, _remote) = MemoryConnector::new();
        let connector = connector.with_pod("web-service", "web-0");
        let session =
            TunnelSession::open(&connector, "default", &web_target(), BTreeSet::from([3000]))
                .await
                .unwrap();
        let mut state = session.subscribe();

        connector.fail_channels();
        state
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .unwrap();

        assert!(session.is_closed());
        assert!(matches!(
            session.open_stream(3000).await,
            Err(TunnelError::Closed)
        ));
    }
}
