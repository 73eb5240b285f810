use crate::auth::{AuthRequest, AuthResult};
use crate::bandwidth::{ChannelEnd, TrafficLimiter};
use crate::dns::{IpVersion, ResolveOutcome};
use crate::protocol::*;
use crate::server::acl::AclContext;
use crate::server::connection::{phase, removal_reason_for, FirstChunkStream};
use crate::server::socks5::connect_from;
use crate::server::stats::RemovalReason;
use crate::server::transfer::{run_transfer, TransferConfig};
use crate::utils::error::AratagaError;
use bytes::{Buf, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_CHUNK_SIZE_LINE: usize = 8 * 1024;

enum RequestOutcome {
    /// The exchange finished on a keep-alive connection; re-enter the
    /// request phase with the same client socket.
    KeepAlive(TcpStream),
    Done(RemovalReason),
}

/// Drive the HTTP phase sequence on a freshly detected connection.
pub(crate) async fn run(
    ctx: &AclContext,
    conn_id: u64,
    stream: FirstChunkStream<TcpStream>,
    peer_v4: Ipv4Addr,
) -> RemovalReason {
    let (chunk, mut stream) = stream.into_parts();

    // The transfer buffer must be able to replay the whole first chunk.
    if chunk.len() > ctx.io_chunk_size {
        warn!(
            conn_id,
            chunk = chunk.len(),
            io_chunk_size = ctx.io_chunk_size,
            "first chunk does not fit the io-chunk buffer"
        );
        send_negative_response(ctx, &mut stream, RESPONSE_INTERNAL_SERVER_ERROR).await;
        return RemovalReason::UnexpectedError;
    }

    let mut buf = BytesMut::from(&chunk[..]);
    let mut first_request = true;

    loop {
        match serve_one_request(ctx, conn_id, stream, &mut buf, peer_v4, first_request).await {
            RequestOutcome::KeepAlive(returned) => {
                stream = returned;
                first_request = false;
            }
            RequestOutcome::Done(reason) => return reason,
        }
    }
}

async fn serve_one_request(
    ctx: &AclContext,
    conn_id: u64,
    mut stream: TcpStream,
    buf: &mut BytesMut,
    peer_v4: Ipv4Addr,
    first_request: bool,
) -> RequestOutcome {
    let timeouts = &ctx.timeouts;

    // Phase 1: request head.
    let head = loop {
        match parse_request_head(buf) {
            Ok(Some((head, consumed))) => {
                buf.advance(consumed);
                break head;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(conn_id, "request head rejected: {}", e);
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_REQUEST_PARSE_ERROR).await;
                return RequestOutcome::Done(RemovalReason::ProtocolError);
            }
        }

        let read =
            tokio::time::timeout(timeouts.http_headers_complete(), stream.read_buf(buf)).await;

        match read {
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    debug!(conn_id, "client closed between requests");
                    return RequestOutcome::Done(RemovalReason::UserEndClosedByClient);
                }
                debug!(conn_id, "client closed mid-head");
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_REQUEST_PARSE_ERROR).await;
                return RequestOutcome::Done(RemovalReason::ProtocolError);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(conn_id, "read failed while collecting the head: {}", e);
                return RequestOutcome::Done(RemovalReason::IoError);
            }
            Err(_) => {
                if !first_request && buf.is_empty() {
                    // A keep-alive connection with no further request.
                    debug!(conn_id, "no follow-up request on keep-alive connection");
                    return RequestOutcome::Done(RemovalReason::HttpNoIncomingRequest);
                }
                warn!(conn_id, "request head did not complete in time");
                send_negative_response(
                    ctx,
                    &mut stream,
                    RESPONSE_REQUEST_TIMEOUT_HEADERS_COMPLETE_TIMEOUT,
                )
                .await;
                return RequestOutcome::Done(RemovalReason::CurrentOperationTimedOut);
            }
        }
    };

    let is_connect = head.method.eq_ignore_ascii_case("CONNECT");

    // Phase 2: target extraction.
    let (target_host, target_port) = match extract_target(&head) {
        Ok(target) => target,
        Err(e) => {
            warn!(conn_id, method = %head.method, "cannot derive target: {}", e);
            send_negative_response(
                ctx,
                &mut stream,
                RESPONSE_BAD_REQUEST_TARGET_HOST_EXTRACTION_FAILURE,
            )
            .await;
            return RequestOutcome::Done(RemovalReason::ProtocolError);
        }
    };

    // Phase 3: authentication. Re-done for every request on a keep-alive
    // connection; the credentials travel with each of them.
    let credentials = match extract_proxy_credentials(&head) {
        Ok(credentials) => credentials,
        Err(e) => {
            debug!(conn_id, "proxy credentials rejected: {}", e);
            send_negative_response(
                ctx,
                &mut stream,
                RESPONSE_BAD_REQUEST_AUTH_PARAMS_EXTRACTION_FAILURE,
            )
            .await;
            return RequestOutcome::Done(RemovalReason::ProtocolError);
        }
    };
    let (username, password) = match credentials {
        Some((username, password)) => (Some(username), Some(password)),
        None => (None, None),
    };

    let verdict = phase(timeouts.authentification(), "http authentication", async {
        Ok(ctx
            .auth
            .authenticate(AuthRequest {
                acl_in_addr: ctx.config.in_addr,
                acl_port: ctx.config.port,
                user_ip: peer_v4,
                username,
                password,
                target_host: target_host.clone(),
                target_port,
            })
            .await)
    })
    .await;

    let (user_id, bandwidth, domain_limits) = match verdict {
        Ok(AuthResult::Successful {
            user_id,
            bandwidth,
            domain_limits,
        }) => (user_id, bandwidth, domain_limits),
        Ok(AuthResult::Failed { reason }) => {
            warn!(conn_id, ?reason, target = %target_host, "request not authorized");
            send_negative_response(ctx, &mut stream, RESPONSE_PROXY_AUTH_REQUIRED_NOT_AUTHORIZED)
                .await;
            return RequestOutcome::Done(RemovalReason::AccessDenied);
        }
        Err(e) => {
            warn!(conn_id, "authentication did not finish: {}", e);
            send_negative_response(ctx, &mut stream, RESPONSE_PROXY_AUTH_REQUIRED_AUTH_TIMEOUT)
                .await;
            return RequestOutcome::Done(removal_reason_for(&e));
        }
    };

    // Phase 4: DNS lookup, unless the target is an address literal.
    let target_ip = match target_host.parse::<IpAddr>() {
        Ok(address) => address,
        Err(_) => {
            let resolved = phase(timeouts.dns_resolving(), "http dns lookup", async {
                Ok(ctx.dns.resolve(&target_host, IpVersion::V4).await)
            })
            .await;

            match resolved {
                Ok(ResolveOutcome::Resolved(address)) => address,
                Ok(ResolveOutcome::Failed { description }) => {
                    warn!(conn_id, target = %target_host, "dns lookup failed: {}", description);
                    send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_DNS_LOOKUP_FAILURE)
                        .await;
                    return RequestOutcome::Done(RemovalReason::UnresolvedTarget);
                }
                Err(e) => {
                    warn!(conn_id, target = %target_host, "dns lookup timed out");
                    send_negative_response(
                        ctx,
                        &mut stream,
                        RESPONSE_REQUEST_TIMEOUT_DNS_LOOKUP_TIMEOUT,
                    )
                    .await;
                    return RequestOutcome::Done(removal_reason_for(&e));
                }
            }
        }
    };

    // Phase 5: outbound connect.
    let target_addr = SocketAddr::new(target_ip, target_port);
    let mut target_stream = match phase(
        timeouts.connect_target(),
        "http connect to target",
        connect_from(ctx.config.out_addr, target_addr),
    )
    .await
    {
        Ok(stream) => stream,
        Err(e @ AratagaError::PhaseTimedOut(_)) => {
            warn!(conn_id, target = %target_addr, "connect timed out");
            send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_CONNECT_TIMEOUT).await;
            return RequestOutcome::Done(removal_reason_for(&e));
        }
        Err(e) => {
            warn!(conn_id, target = %target_addr, "connect failed: {}", e);
            send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_CONNECT_FAILURE).await;
            return RequestOutcome::Done(RemovalReason::IoError);
        }
    };

    let limiter = ctx.bandwidth.limiter(
        user_id,
        bandwidth,
        domain_limits.map(|limit| (limit.domain, limit.limits)),
    );

    // Phase 6: CONNECT becomes a plain tunnel.
    if is_connect {
        if let Err(e) = stream
            .write_all(RESPONSE_OK_FOR_CONNECT_METHOD.as_bytes())
            .await
        {
            debug!(conn_id, "failed to confirm CONNECT: {}", e);
            return RequestOutcome::Done(RemovalReason::UserEndBroken);
        }

        info!(conn_id, target = %target_addr, "http CONNECT tunnel established");

        // Bytes pipelined after the head belong to the tunnel.
        let client = FirstChunkStream::new(buf.split().freeze(), stream);
        let reason = run_transfer(
            client,
            target_stream,
            limiter,
            TransferConfig {
                chunk_size: ctx.io_chunk_size,
                idle_timeout: timeouts.idle_connection(),
            },
            CancellationToken::new(),
        )
        .await;
        return RequestOutcome::Done(reason);
    }

    // Phase 7: plain request forwarding.
    let client_keep_alive = request_keeps_alive(&head);

    let request_framing = match request_body_framing(&head) {
        Ok(framing) => framing,
        Err(e) => {
            debug!(conn_id, "request framing rejected: {}", e);
            send_negative_response(ctx, &mut stream, RESPONSE_BAD_REQUEST_PARSE_ERROR).await;
            return RequestOutcome::Done(RemovalReason::ProtocolError);
        }
    };

    info!(
        conn_id,
        user_id,
        method = %head.method,
        target = %target_addr,
        "forwarding http request"
    );

    // The origin connection serves exactly this request.
    let outgoing_head = serialize_outgoing_request(&head, false);
    if let Err(e) = target_stream.write_all(&outgoing_head).await {
        debug!(conn_id, "failed to forward the request head: {}", e);
        send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_CONNECT_FAILURE).await;
        return RequestOutcome::Done(RemovalReason::TargetEndBroken);
    }

    {
        let mut relay = BodyRelay {
            reader: &mut stream,
            writer: &mut target_stream,
            buf,
            limiter: &limiter,
            read_end: ChannelEnd::User,
            chunk_size: ctx.io_chunk_size,
            read_timeout: timeouts.idle_connection(),
        };
        match relay.relay(request_framing).await {
            Ok(()) => {}
            Err(RelayError::Read(e)) => {
                debug!(conn_id, "request body lost: {}", e);
                return RequestOutcome::Done(RemovalReason::UserEndBroken);
            }
            Err(RelayError::Write(e)) => {
                debug!(conn_id, "request body not deliverable: {}", e);
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE)
                    .await;
                return RequestOutcome::Done(RemovalReason::TargetEndBroken);
            }
        }
    }

    if let Err(e) = target_stream.flush().await {
        debug!(conn_id, "flush towards the target failed: {}", e);
        send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE).await;
        return RequestOutcome::Done(RemovalReason::TargetEndBroken);
    }

    // Read and validate the response head.
    let mut response_buf = BytesMut::with_capacity(1024);
    let response_head = loop {
        match parse_response_head(&response_buf) {
            Ok(Some((response_head, consumed))) => {
                response_buf.advance(consumed);
                break response_head;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(conn_id, "malformed response from the target: {}", e);
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE)
                    .await;
                return RequestOutcome::Done(RemovalReason::TargetEndBroken);
            }
        }

        let read = tokio::time::timeout(
            timeouts.idle_connection(),
            target_stream.read_buf(&mut response_buf),
        )
        .await;

        match read {
            Ok(Ok(0)) => {
                warn!(conn_id, "target closed before a complete response head");
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE)
                    .await;
                return RequestOutcome::Done(RemovalReason::TargetEndBroken);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(conn_id, "read from the target failed: {}", e);
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE)
                    .await;
                return RequestOutcome::Done(RemovalReason::TargetEndBroken);
            }
            Err(_) => {
                warn!(conn_id, "target response timed out");
                send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE)
                    .await;
                return RequestOutcome::Done(RemovalReason::CurrentOperationTimedOut);
            }
        }
    };

    let head_request = head.method.eq_ignore_ascii_case("HEAD");
    let response_framing = match response_body_framing(&response_head, head_request) {
        Ok(framing) => framing,
        Err(e) => {
            warn!(conn_id, "response framing rejected: {}", e);
            send_negative_response(ctx, &mut stream, RESPONSE_BAD_GATEWAY_INVALID_RESPONSE).await;
            return RequestOutcome::Done(RemovalReason::TargetEndBroken);
        }
    };

    // An EOF-delimited body forces the client side closed as well.
    let keep_alive = client_keep_alive && response_framing != BodyFraming::UntilEof;

    let incoming_head = serialize_incoming_response(&response_head, keep_alive);
    if let Err(e) = stream.write_all(&incoming_head).await {
        debug!(conn_id, "failed to forward the response head: {}", e);
        return RequestOutcome::Done(RemovalReason::UserEndBroken);
    }

    {
        let mut relay = BodyRelay {
            reader: &mut target_stream,
            writer: &mut stream,
            buf: &mut response_buf,
            limiter: &limiter,
            read_end: ChannelEnd::Target,
            chunk_size: ctx.io_chunk_size,
            read_timeout: timeouts.idle_connection(),
        };
        match relay.relay(response_framing).await {
            Ok(()) => {}
            Err(RelayError::Read(e)) => {
                debug!(conn_id, "response body lost: {}", e);
                return RequestOutcome::Done(RemovalReason::TargetEndBroken);
            }
            Err(RelayError::Write(e)) => {
                debug!(conn_id, "client went away mid-response: {}", e);
                return RequestOutcome::Done(RemovalReason::UserEndBroken);
            }
        }
    }

    if let Err(e) = stream.flush().await {
        debug!(conn_id, "flush towards the client failed: {}", e);
        return RequestOutcome::Done(RemovalReason::UserEndBroken);
    }

    debug!(conn_id, status = response_head.status, keep_alive, "http exchange finished");

    if keep_alive {
        RequestOutcome::KeepAlive(stream)
    } else {
        RequestOutcome::Done(RemovalReason::NormalCompletion)
    }
}

/// Write one canned negative response, bounded by its own timeout, then
/// shut the client down. Failures only get logged: the connection is on its
/// way out already.
async fn send_negative_response(ctx: &AclContext, stream: &mut TcpStream, body: &str) {
    let write = tokio::time::timeout(ctx.timeouts.http_negative_response(), async {
        stream.write_all(body.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    })
    .await;

    match write {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("negative response not delivered: {}", e),
        Err(_) => debug!("negative response timed out"),
    }
}

enum RelayError {
    Read(AratagaError),
    Write(AratagaError),
}

/// Moves one message body between the client and the target, preserving the
/// original framing bytes and debiting the traffic limiter on both ends.
struct BodyRelay<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
    buf: &'a mut BytesMut,
    limiter: &'a TrafficLimiter,
    read_end: ChannelEnd,
    chunk_size: usize,
    read_timeout: Duration,
}

impl<R, W> BodyRelay<'_, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn relay(&mut self, framing: BodyFraming) -> Result<(), RelayError> {
        match framing {
            BodyFraming::None => Ok(()),
            BodyFraming::ContentLength(n) => self.relay_exact(n).await,
            BodyFraming::Chunked => self.relay_chunked().await,
            BodyFraming::UntilEof => self.relay_until_eof().await,
        }
    }

    /// Pull more bytes off the reader under the read-end quota. Returns 0 on
    /// EOF.
    async fn fill(&mut self) -> Result<usize, RelayError> {
        let allowed = loop {
            let allowed = self.limiter.try_reserve(self.read_end, self.chunk_size as u64);
            if allowed > 0 {
                break allowed;
            }
            self.limiter.wait_next_turn().await;
        };

        let mut scratch = vec![0u8; allowed as usize];
        let read = tokio::time::timeout(self.read_timeout, self.reader.read(&mut scratch)).await;

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.limiter.commit(self.read_end, allowed, 0);
                return Err(RelayError::Read(e.into()));
            }
            Err(_) => {
                self.limiter.commit(self.read_end, allowed, 0);
                return Err(RelayError::Read(AratagaError::PhaseTimedOut(
                    "http body read",
                )));
            }
        };

        self.limiter.commit(self.read_end, allowed, n as u64);
        self.buf.extend_from_slice(&scratch[..n]);
        Ok(n)
    }

    /// Push bytes to the writer, accounted under the opposite end.
    async fn write_out(&mut self, data: &[u8]) -> Result<(), RelayError> {
        let write_end = self.read_end.opposite();
        let mut written = 0usize;

        while written < data.len() {
            let want = (data.len() - written) as u64;
            let window = loop {
                let window = self.limiter.try_reserve(write_end, want);
                if window > 0 {
                    break window;
                }
                self.limiter.wait_next_turn().await;
            };

            let slice = &data[written..written + window as usize];
            match self.writer.write_all(slice).await {
                Ok(()) => {
                    self.limiter.commit(write_end, window, window);
                    written += window as usize;
                }
                Err(e) => {
                    self.limiter.commit(write_end, window, 0);
                    return Err(RelayError::Write(e.into()));
                }
            }
        }

        Ok(())
    }

    async fn drain_buffered(&mut self, n: usize) -> Result<(), RelayError> {
        let data = self.buf.split_to(n);
        self.write_out(&data).await
    }

    async fn relay_exact(&mut self, mut remaining: u64) -> Result<(), RelayError> {
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(RelayError::Read(AratagaError::Protocol(
                    "unexpected EOF in message body".to_string(),
                )));
            }
            let n = (self.buf.len() as u64).min(remaining) as usize;
            self.drain_buffered(n).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    async fn relay_until_eof(&mut self) -> Result<(), RelayError> {
        loop {
            if !self.buf.is_empty() {
                let n = self.buf.len();
                self.drain_buffered(n).await?;
            }
            if self.fill().await? == 0 {
                return Ok(());
            }
        }
    }

    async fn read_line(&mut self) -> Result<Bytes, RelayError> {
        loop {
            if let Some(pos) = find_crlf(self.buf) {
                return Ok(self.buf.split_to(pos + 2).freeze());
            }
            if self.buf.len() > MAX_CHUNK_SIZE_LINE {
                return Err(RelayError::Read(AratagaError::Protocol(
                    "chunk-size line is too long".to_string(),
                )));
            }
            if self.fill().await? == 0 {
                return Err(RelayError::Read(AratagaError::Protocol(
                    "unexpected EOF in chunked body".to_string(),
                )));
            }
        }
    }

    async fn relay_chunked(&mut self) -> Result<(), RelayError> {
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)
                .map_err(RelayError::Read)?;
            self.write_out(&line).await?;

            if size == 0 {
                // Trailers pass through up to (and including) the blank line.
                loop {
                    let line = self.read_line().await?;
                    let done = line.as_ref() == b"\r\n";
                    self.write_out(&line).await?;
                    if done {
                        return Ok(());
                    }
                }
            }

            // Chunk data plus its trailing CRLF.
            self.relay_exact(size + 2).await?;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, AratagaError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| AratagaError::Protocol("invalid chunk-size line".to_string()))?;
    let size = line
        .trim_end_matches("\r\n")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| AratagaError::Protocol(format!("invalid chunk size '{}'", size)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_lines_parse() {
        assert_eq!(parse_chunk_size(b"4\r\n").unwrap(), 4);
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"5;ext=1\r\n").unwrap(), 5);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
    }

    #[test]
    fn crlf_search_finds_the_first_boundary() {
        assert_eq!(find_crlf(b"ab\r\ncd\r\n"), Some(2));
        assert_eq!(find_crlf(b"abcd"), None);
    }
}
