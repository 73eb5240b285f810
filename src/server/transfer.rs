use crate::bandwidth::{ChannelEnd, TrafficLimiter};
use crate::server::stats::RemovalReason;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferConfig {
    pub chunk_size: usize,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineEnd {
    Eof,
    BrokenRead,
    BrokenWrite,
    Cancelled,
}

fn is_connection_closed_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// Shuttle bytes between the two sockets of a connection under the user's
/// bandwidth budget until both halves close, the idle guard fires, or the
/// connection is released.
///
/// Each direction runs as its own pipeline: bytes read off one socket are
/// accounted against that socket's end of the channel, and the write to the
/// opposite socket is accounted against the opposite end. A direction whose
/// turn allowance is exhausted parks until the next turn.
pub(crate) async fn run_transfer<C, T>(
    client: C,
    target: T,
    limiter: TrafficLimiter,
    config: TransferConfig,
    cancel: CancellationToken,
) -> RemovalReason
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let limiter = Arc::new(limiter);
    let started = Instant::now();
    let activity = Arc::new(AtomicU64::new(0));
    let pipelines_cancel = cancel.child_token();

    let (client_read, client_write) = split(client);
    let (target_read, target_write) = split(target);

    let upstream = tokio::spawn(pipeline(
        client_read,
        target_write,
        Arc::clone(&limiter),
        ChannelEnd::User,
        config.chunk_size,
        pipelines_cancel.clone(),
        Arc::clone(&activity),
        started,
    ));

    let downstream = tokio::spawn(pipeline(
        target_read,
        client_write,
        Arc::clone(&limiter),
        ChannelEnd::Target,
        config.chunk_size,
        pipelines_cancel.clone(),
        Arc::clone(&activity),
        started,
    ));

    let joined = async move { tokio::join!(upstream, downstream) };
    tokio::pin!(joined);

    let mut idle = false;
    let (up, down) = tokio::select! {
        result = &mut joined => result,
        _ = idle_guard(Arc::clone(&activity), started, config.idle_timeout) => {
            debug!("no activity for too long, releasing the connection");
            idle = true;
            pipelines_cancel.cancel();
            joined.await
        }
    };

    let up = up.unwrap_or(PipelineEnd::BrokenRead);
    let down = down.unwrap_or(PipelineEnd::BrokenRead);

    if idle {
        return RemovalReason::NoActivityForTooLong;
    }
    if cancel.is_cancelled() {
        return RemovalReason::CurrentOperationCanceled;
    }

    // client -> target: a broken read is the user end, a broken write the
    // target end; the reverse pipeline mirrors that.
    match (up, down) {
        (PipelineEnd::BrokenRead, _) => RemovalReason::UserEndBroken,
        (PipelineEnd::BrokenWrite, _) => RemovalReason::TargetEndBroken,
        (_, PipelineEnd::BrokenRead) => RemovalReason::TargetEndBroken,
        (_, PipelineEnd::BrokenWrite) => RemovalReason::UserEndBroken,
        _ => RemovalReason::NormalCompletion,
    }
}

async fn idle_guard(activity: Arc<AtomicU64>, started: Instant, idle_timeout: Duration) {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let last_activity_ms = activity.load(Ordering::Relaxed);
        let idle_for = started.elapsed().saturating_sub(Duration::from_millis(last_activity_ms));
        if idle_for >= idle_timeout {
            return;
        }
    }
}

fn touch(activity: &AtomicU64, started: Instant) {
    activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
}

#[allow(clippy::too_many_arguments)]
async fn pipeline<R, W>(
    mut reader: R,
    mut writer: W,
    limiter: Arc<TrafficLimiter>,
    read_end: ChannelEnd,
    chunk_size: usize,
    cancel: CancellationToken,
    activity: Arc<AtomicU64>,
    started: Instant,
) -> PipelineEnd
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buffer = vec![0u8; chunk_size];
    let write_end = read_end.opposite();

    loop {
        // Reserve a read window for this turn, or park until the next one.
        let allowed = loop {
            let allowed = limiter.try_reserve(read_end, chunk_size as u64);
            if allowed > 0 {
                break allowed;
            }
            tokio::select! {
                _ = cancel.cancelled() => return PipelineEnd::Cancelled,
                _ = limiter.wait_next_turn() => {}
            }
        };

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                limiter.commit(read_end, allowed, 0);
                return PipelineEnd::Cancelled;
            }
            result = reader.read(&mut buffer[..allowed as usize]) => result,
        };

        let n = match read {
            Ok(0) => {
                limiter.commit(read_end, allowed, 0);
                trace!(?read_end, "half-duplex closed");
                let _ = writer.shutdown().await;
                return PipelineEnd::Eof;
            }
            Ok(n) => {
                limiter.commit(read_end, allowed, n as u64);
                touch(&activity, started);
                n
            }
            Err(e) => {
                limiter.commit(read_end, allowed, 0);
                if is_connection_closed_error(&e) {
                    trace!(?read_end, "read side closed with {:?}, treating as EOF", e.kind());
                    let _ = writer.shutdown().await;
                    return PipelineEnd::Eof;
                }
                debug!(?read_end, "read error: {}", e);
                return PipelineEnd::BrokenRead;
            }
        };

        // Push the bytes out, accounted under the opposite end.
        let mut written = 0usize;
        while written < n {
            let want = (n - written) as u64;
            let window = loop {
                let window = limiter.try_reserve(write_end, want);
                if window > 0 {
                    break window;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return PipelineEnd::Cancelled,
                    _ = limiter.wait_next_turn() => {}
                }
            };

            let slice = &buffer[written..written + window as usize];
            let write = tokio::select! {
                _ = cancel.cancelled() => {
                    limiter.commit(write_end, window, 0);
                    return PipelineEnd::Cancelled;
                }
                result = writer.write_all(slice) => result,
            };

            match write {
                Ok(()) => {
                    limiter.commit(write_end, window, window);
                    written += window as usize;
                    touch(&activity, started);
                }
                Err(e) => {
                    limiter.commit(write_end, window, 0);
                    debug!(?read_end, "write error: {}", e);
                    return PipelineEnd::BrokenWrite;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::{BandwidthConfig, BandwidthRegistry};
    use tokio::io::duplex;

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn bytes_flow_both_ways_and_eof_completes() {
        let registry = BandwidthRegistry::new(BandwidthConfig::default());
        let limiter = registry.limiter(1, BandwidthConfig::default(), None);

        let (mut client_far, client_near) = duplex(4096);
        let (mut target_far, target_near) = duplex(4096);

        let transfer = tokio::spawn(run_transfer(
            client_near,
            target_near,
            limiter,
            config(),
            CancellationToken::new(),
        ));

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_far);
        drop(target_far);

        let reason = tokio::time::timeout(Duration::from_secs(2), transfer)
            .await
            .expect("transfer finishes")
            .expect("join");
        assert_eq!(reason, RemovalReason::NormalCompletion);
    }

    #[tokio::test]
    async fn throttled_direction_waits_for_the_next_turn() {
        let registry = BandwidthRegistry::new(BandwidthConfig::default());
        // client -> target reads are bounded by the outbound limit.
        let limiter = registry.limiter(
            1,
            BandwidthConfig {
                inbound: 0,
                outbound: 1000,
            },
            None,
        );

        let (mut client_far, client_near) = duplex(8192);
        let (mut target_far, target_near) = duplex(8192);

        let _transfer = tokio::spawn(run_transfer(
            client_near,
            target_near,
            limiter,
            config(),
            CancellationToken::new(),
        ));

        let payload = vec![0x41u8; 2000];
        client_far.write_all(&payload).await.unwrap();

        // The first turn lets at most 1000 bytes through.
        let mut got = vec![0u8; 1000];
        tokio::time::timeout(Duration::from_millis(500), target_far.read_exact(&mut got))
            .await
            .expect("first window arrives")
            .unwrap();

        let mut more = [0u8; 1];
        let starved =
            tokio::time::timeout(Duration::from_millis(300), target_far.read_exact(&mut more))
                .await;
        assert!(starved.is_err(), "second window leaked before the turn");

        // A full-second gap scales the old quota to ~1000, clearing the
        // consumption; the remaining bytes flow on the new turn.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        registry.run_turn();

        let mut rest = vec![0u8; 1000];
        tokio::time::timeout(Duration::from_secs(1), target_far.read_exact(&mut rest))
            .await
            .expect("second window arrives")
            .unwrap();
    }

    #[tokio::test]
    async fn idle_connection_is_released() {
        let registry = BandwidthRegistry::new(BandwidthConfig::default());
        let limiter = registry.limiter(1, BandwidthConfig::default(), None);

        let (_client_far, client_near) = duplex(64);
        let (_target_far, target_near) = duplex(64);

        let reason = tokio::time::timeout(
            Duration::from_secs(5),
            run_transfer(
                client_near,
                target_near,
                limiter,
                TransferConfig {
                    chunk_size: 1024,
                    idle_timeout: Duration::from_millis(600),
                },
                CancellationToken::new(),
            ),
        )
        .await
        .expect("idle guard fires");
        assert_eq!(reason, RemovalReason::NoActivityForTooLong);
    }

    #[tokio::test]
    async fn release_cancels_the_transfer() {
        let registry = BandwidthRegistry::new(BandwidthConfig::default());
        let limiter = registry.limiter(1, BandwidthConfig::default(), None);

        let (_client_far, client_near) = duplex(64);
        let (_target_far, target_near) = duplex(64);

        let cancel = CancellationToken::new();
        let transfer = tokio::spawn(run_transfer(
            client_near,
            target_near,
            limiter,
            config(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let reason = tokio::time::timeout(Duration::from_secs(2), transfer)
            .await
            .expect("cancelled transfer finishes")
            .expect("join");
        assert_eq!(reason, RemovalReason::CurrentOperationCanceled);
    }
}
