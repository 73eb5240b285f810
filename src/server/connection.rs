use crate::config::AclProtocol;
use crate::protocol::{detect_protocol, DetectedProtocol};
use crate::server::acl::AclContext;
use crate::server::stats::{ConnectionKind, RemovalReason};
use crate::server::{http, socks5};
use crate::utils::error::AratagaError;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How much of a fresh connection is read for protocol detection.
pub const FIRST_CHUNK_SIZE: usize = 512;

/// A stream that replays already-buffered bytes before reading from the
/// underlying socket. The protocol-detection phase reads a first chunk to
/// look at the opening byte; the successor handler consumes those same bytes
/// through this wrapper as if they were never taken off the wire.
pub struct FirstChunkStream<S> {
    chunk: Bytes,
    inner: S,
}

impl<S> FirstChunkStream<S> {
    pub fn new(chunk: Bytes, inner: S) -> Self {
        Self { chunk, inner }
    }

    /// Bytes that were read but not yet consumed.
    pub fn remaining_chunk(&self) -> &[u8] {
        &self.chunk
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.chunk, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FirstChunkStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.chunk.is_empty() {
            let n = this.chunk.len().min(buf.remaining());
            buf.put_slice(&this.chunk.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FirstChunkStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Run a phase under its timeout, turning expiry into `PhaseTimedOut`.
pub(crate) async fn phase<T, F>(
    duration: Duration,
    name: &'static str,
    future: F,
) -> crate::utils::error::Result<T>
where
    F: Future<Output = crate::utils::error::Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(AratagaError::PhaseTimedOut(name)),
    }
}

/// Translate a phase failure into the terminal removal reason.
pub(crate) fn removal_reason_for(error: &AratagaError) -> RemovalReason {
    match error {
        AratagaError::Io(_) => RemovalReason::IoError,
        AratagaError::Protocol(_)
        | AratagaError::UnsupportedCommand(_)
        | AratagaError::UnsupportedAddressType(_) => RemovalReason::ProtocolError,
        AratagaError::AuthFailed(_) | AratagaError::AccessDenied(_) => RemovalReason::AccessDenied,
        AratagaError::UnresolvedTarget(_) => RemovalReason::UnresolvedTarget,
        AratagaError::PhaseTimedOut(_) => RemovalReason::CurrentOperationTimedOut,
        AratagaError::ConnectionClosed => RemovalReason::UserEndClosedByClient,
        AratagaError::Config(_) | AratagaError::Unexpected(_) => RemovalReason::UnexpectedError,
    }
}

/// Drive one accepted connection from protocol detection to its terminal
/// state. Returns the single removal reason for the connection.
pub async fn handle_connection(
    ctx: &AclContext,
    conn_id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> RemovalReason {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id, "failed to set TCP_NODELAY on client socket: {}", e);
    }

    // The authentication map speaks IPv4 only.
    let peer_v4 = match client_ipv4(peer.ip()) {
        Some(addr) => addr,
        None => {
            warn!(conn_id, peer = %peer, "client address is not IPv4");
            return RemovalReason::IpVersionMismatch;
        }
    };

    let run = run_detected(ctx, conn_id, stream, peer_v4);
    tokio::select! {
        reason = run => reason,
        _ = cancel.cancelled() => RemovalReason::CurrentOperationCanceled,
    }
}

async fn run_detected(
    ctx: &AclContext,
    conn_id: u64,
    mut stream: TcpStream,
    peer_v4: Ipv4Addr,
) -> RemovalReason {
    let mut first_chunk = BytesMut::with_capacity(FIRST_CHUNK_SIZE);

    let read = tokio::time::timeout(
        ctx.timeouts.protocol_detection(),
        stream.read_buf(&mut first_chunk),
    )
    .await;

    let n = match read {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!(conn_id, "read failed during protocol detection: {}", e);
            return RemovalReason::IoError;
        }
        Err(_) => {
            warn!(conn_id, "protocol-detection timed out");
            return RemovalReason::CurrentOperationTimedOut;
        }
    };

    if n == 0 {
        debug!(conn_id, "client closed before sending anything");
        return RemovalReason::UserEndClosedByClient;
    }

    let first_byte = first_chunk[0];
    let detected = detect_protocol(first_byte);

    // An ACL bound to a single protocol only tries that branch.
    let accepted = match (ctx.config.protocol, detected) {
        (AclProtocol::Auto, protocol) => protocol,
        (AclProtocol::Socks5, DetectedProtocol::Socks5) => DetectedProtocol::Socks5,
        (AclProtocol::Http, DetectedProtocol::Http) => DetectedProtocol::Http,
        _ => DetectedProtocol::Unknown,
    };

    let stream = FirstChunkStream::new(first_chunk.freeze(), stream);

    match accepted {
        DetectedProtocol::Socks5 => {
            ctx.stats.inc_connection(ConnectionKind::Socks5);
            socks5::run(ctx, conn_id, stream, peer_v4).await
        }
        DetectedProtocol::Http => {
            // Counted here, once per TCP connection: keep-alive re-entry into
            // the request phase must not bump the counter again.
            ctx.stats.inc_connection(ConnectionKind::Http);
            http::run(ctx, conn_id, stream, peer_v4).await
        }
        DetectedProtocol::Unknown => {
            warn!(
                conn_id,
                first_byte = format!("0x{:02x}", first_byte),
                "unsupported protocol in the connection"
            );
            RemovalReason::UnsupportedProtocol
        }
    }
}

fn client_ipv4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
