use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Direction, TunnelError};

/// Size of the single buffer each copy loop owns
const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// What ended a relay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEnd {
    /// The local client closed its side
    Local,
    /// The remote stream reached EOF
    Remote,
    Cancelled,
    IdleTimeout,
}

/// Bytes moved by a finished relay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayReport {
    pub sent: u64,
    pub received: u64,
    pub ended_by: RelayEnd,
}

enum Outcome {
    Leg(Direction, io::Result<()>),
    Cancelled,
    Idle,
}

/// Pump bytes between `local` and `remote` until either side finishes.
///
/// Both copy loops run concurrently. Whichever ends first (EOF, error,
/// `cancel`, or the idle timeout) stops the other; both write sides are then
/// shut down and both endpoints are dropped here, exactly once.
pub async fn relay<L, R>(
    local: L,
    remote: R,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
) -> Result<RelayReport, TunnelError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let mut sent = 0u64;
    let mut received = 0u64;

    let outcome = tokio::select! {
        result = pump(&mut local_read, &mut remote_write, &mut sent, &last_activity, started) => {
            Outcome::Leg(Direction::LocalToRemote, result)
        }
        result = pump(&mut remote_read, &mut local_write, &mut received, &last_activity, started) => {
            Outcome::Leg(Direction::RemoteToLocal, result)
        }
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = idle_expired(idle_timeout, &last_activity, started) => Outcome::Idle,
    };

    // Best effort: the peer may already be gone
    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;

    let ended_by = match outcome {
        Outcome::Leg(direction, Err(source)) => {
            return Err(TunnelError::Relay { direction, source });
        }
        Outcome::Leg(Direction::LocalToRemote, Ok(())) => RelayEnd::Local,
        Outcome::Leg(Direction::RemoteToLocal, Ok(())) => RelayEnd::Remote,
        Outcome::Cancelled => RelayEnd::Cancelled,
        Outcome::Idle => RelayEnd::IdleTimeout,
    };

    Ok(RelayReport {
        sent,
        received,
        ended_by,
    })
}

/// Copy until EOF, counting bytes and stamping activity
async fn pump<Rd, Wr>(
    reader: &mut Rd,
    writer: &mut Wr,
    moved: &mut u64,
    last_activity: &AtomicU64,
    started: Instant,
) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *moved += n as u64;
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Resolves once neither direction has moved a byte for `timeout`
async fn idle_expired(timeout: Option<Duration>, last_activity: &AtomicU64, started: Instant) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };

    loop {
        let last = started + Duration::from_millis(last_activity.load(Ordering::Relaxed));
        if last.elapsed() >= timeout {
            return;
        }
        tokio::time::sleep_until(last + timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_bytes_arrive_unchanged_both_ways() {
        let (local, mut client) = duplex(4096);
        let (remote, mut pod) = duplex(4096);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay(local, remote, cancel.clone(), None));

        // Larger than both the copy buffer and the duplex buffers
        let upstream = pattern(100_000);
        let writer = {
            let upstream = upstream.clone();
            tokio::spawn(async move {
                client.write_all(&upstream).await.unwrap();
                client
            })
        };
        let mut seen = vec![0u8; upstream.len()];
        pod.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, upstream);
        let mut client = writer.await.unwrap();

        let downstream = pattern(20_000);
        let writer = {
            let downstream = downstream.clone();
            tokio::spawn(async move {
                pod.write_all(&downstream).await.unwrap();
                pod
            })
        };
        let mut seen = vec![0u8; downstream.len()];
        client.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, downstream);
        let _pod = writer.await.unwrap();

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.ended_by, RelayEnd::Cancelled);
        assert_eq!(report.sent, upstream.len() as u64);
        assert_eq!(report.received, downstream.len() as u64);
    }

    #[tokio::test]
    async fn test_local_eof_closes_remote() {
        let (local, client) = duplex(1024);
        let (remote, mut pod) = duplex(1024);
        let task = tokio::spawn(relay(local, remote, CancellationToken::new(), None));

        drop(client);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.ended_by, RelayEnd::Local);

        // The relay dropped its end, so the pod sees EOF
        let mut buf = Vec::new();
        assert_eq!(pod.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_local() {
        let (local, mut client) = duplex(1024);
        let (remote, mut pod) = duplex(1024);
        let task = tokio::spawn(relay(local, remote, CancellationToken::new(), None));

        pod.write_all(b"bye").await.unwrap();
        drop(pod);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.ended_by, RelayEnd::Remote);
        assert_eq!(report.received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_relay() {
        let (local, _client) = duplex(1024);
        let (remote, _pod) = duplex(1024);

        let report = relay(
            local,
            remote,
            CancellationToken::new(),
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();

        assert_eq!(report.ended_by, RelayEnd::IdleTimeout);
        assert_eq!(report.sent + report.received, 0);
    }
}
