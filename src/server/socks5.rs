use crate::auth::{AuthRequest, AuthResult};
use crate::dns::{IpVersion, ResolveOutcome};
use crate::protocol::*;
use crate::server::acl::AclContext;
use crate::server::connection::{phase, removal_reason_for, FirstChunkStream};
use crate::server::stats::RemovalReason;
use crate::server::transfer::{run_transfer, TransferConfig};
use crate::utils::error::AratagaError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NO_BIND_ADDRESS: Address = Address::IPv4([0, 0, 0, 0]);

/// Open the outbound connection using the ACL's configured source address.
pub(crate) async fn connect_from(
    out_addr: IpAddr,
    target: SocketAddr,
) -> crate::utils::error::Result<TcpStream> {
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if !out_addr.is_unspecified() && out_addr.is_ipv4() == target.is_ipv4() {
        socket.bind(SocketAddr::new(out_addr, 0))?;
    }

    let stream = socket.connect(target).await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY on target socket: {}", e);
    }
    Ok(stream)
}

fn reply_for_connect_error(error: &AratagaError) -> ReplyCode {
    match error {
        AratagaError::Io(e) => match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            std::io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            _ => ReplyCode::HostUnreachable,
        },
        AratagaError::PhaseTimedOut(_) => ReplyCode::TtlExpired,
        _ => ReplyCode::GeneralFailure,
    }
}

fn address_of(addr: SocketAddr) -> Address {
    match addr {
        SocketAddr::V4(v4) => Address::IPv4(v4.ip().octets()),
        SocketAddr::V6(v6) => Address::IPv6(v6.ip().octets()),
    }
}

/// Drive the SOCKS5 phase sequence on a freshly detected connection.
pub(crate) async fn run(
    ctx: &AclContext,
    conn_id: u64,
    mut stream: FirstChunkStream<TcpStream>,
    peer_v4: Ipv4Addr,
) -> RemovalReason {
    let timeouts = &ctx.timeouts;

    // Phase 1: auth-method selection.
    let greeting = match phase(
        timeouts.socks_handshake_phase(),
        "socks5 auth-method selection",
        parse_socks5_client_greeting(&mut stream),
    )
    .await
    {
        Ok(greeting) => greeting,
        Err(e) => {
            warn!(conn_id, "auth-method selection failed: {}", e);
            return removal_reason_for(&e);
        }
    };

    // Username/password wins when offered; no-auth clients are identified
    // by their address at the command stage.
    let method = if greeting.methods.contains(&AuthMethod::UserPass) {
        AuthMethod::UserPass
    } else if greeting.methods.contains(&AuthMethod::NoAuth) {
        AuthMethod::NoAuth
    } else {
        let _ = send_server_choice(&mut stream, AuthMethod::NoAcceptable).await;
        warn!(conn_id, "client offers no acceptable auth method");
        return RemovalReason::AccessDenied;
    };

    if let Err(e) = send_server_choice(&mut stream, method).await {
        debug!(conn_id, "failed to send method choice: {}", e);
        return removal_reason_for(&e);
    }

    // Phase 2: username/password subnegotiation (RFC 1929).
    let credentials = if method == AuthMethod::UserPass {
        let (username, password) = match phase(
            timeouts.socks_handshake_phase(),
            "socks5 userpass subnegotiation",
            parse_userpass_auth(&mut stream),
        )
        .await
        {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(conn_id, "userpass subnegotiation failed: {}", e);
                return removal_reason_for(&e);
            }
        };

        // The credentials are checked now; the target is authorized again
        // once the command PDU names it.
        let precheck = phase(
            timeouts.authentification(),
            "socks5 authentication",
            async {
                Ok(ctx
                    .auth
                    .authenticate(AuthRequest {
                        acl_in_addr: ctx.config.in_addr,
                        acl_port: ctx.config.port,
                        user_ip: peer_v4,
                        username: Some(username.clone()),
                        password: Some(password.clone()),
                        target_host: String::new(),
                        target_port: 0,
                    })
                    .await)
            },
        )
        .await;

        match precheck {
            Ok(AuthResult::Successful { user_id, .. }) => {
                if let Err(e) = send_auth_response(&mut stream, true).await {
                    return removal_reason_for(&e);
                }
                debug!(conn_id, user_id, "socks5 credentials accepted");
            }
            Ok(AuthResult::Failed { reason }) => {
                let _ = send_auth_response(&mut stream, false).await;
                warn!(conn_id, ?reason, "socks5 credentials rejected");
                return RemovalReason::AccessDenied;
            }
            Err(e) => {
                let _ = send_auth_response(&mut stream, false).await;
                warn!(conn_id, "socks5 authentication did not finish: {}", e);
                return removal_reason_for(&e);
            }
        }

        Some((username, password))
    } else {
        None
    };

    // Phase 3: command PDU.
    let request = match phase(
        timeouts.socks_handshake_phase(),
        "socks5 command",
        parse_socks5_request(&mut stream),
    )
    .await
    {
        Ok(request) => request,
        Err(e) => {
            let reply = match &e {
                AratagaError::UnsupportedCommand(_) => ReplyCode::CommandNotSupported,
                AratagaError::UnsupportedAddressType(_) => ReplyCode::AddressTypeNotSupported,
                _ => ReplyCode::GeneralFailure,
            };
            let _ = send_socks5_response(&mut stream, reply, NO_BIND_ADDRESS, 0).await;
            warn!(conn_id, "command PDU rejected: {}", e);
            return removal_reason_for(&e);
        }
    };

    let target_host = request.address.to_string();
    info!(
        conn_id,
        command = ?request.command,
        target = %target_host,
        port = request.port,
        "socks5 request"
    );

    // Phase 3b: authorize the named target.
    let (username, password) = match credentials {
        Some((username, password)) => (Some(username), Some(password)),
        None => (None, None),
    };
    let verdict = phase(
        timeouts.authentification(),
        "socks5 target authorization",
        async {
            Ok(ctx
                .auth
                .authenticate(AuthRequest {
                    acl_in_addr: ctx.config.in_addr,
                    acl_port: ctx.config.port,
                    user_ip: peer_v4,
                    username,
                    password,
                    target_host: target_host.clone(),
                    target_port: request.port,
                })
                .await)
        },
    )
    .await;

    let (user_id, bandwidth, domain_limits) = match verdict {
        Ok(AuthResult::Successful {
            user_id,
            bandwidth,
            domain_limits,
        }) => (user_id, bandwidth, domain_limits),
        Ok(AuthResult::Failed { reason }) => {
            let _ = send_socks5_response(
                &mut stream,
                ReplyCode::ConnectionNotAllowed,
                NO_BIND_ADDRESS,
                0,
            )
            .await;
            warn!(conn_id, ?reason, target = %target_host, "target disallowed");
            return RemovalReason::AccessDenied;
        }
        Err(e) => {
            let _ =
                send_socks5_response(&mut stream, ReplyCode::GeneralFailure, NO_BIND_ADDRESS, 0)
                    .await;
            return removal_reason_for(&e);
        }
    };

    // Phase 4: resolve the target when it is named by domain.
    let target_ip = match &request.address {
        Address::IPv4(octets) => IpAddr::V4((*octets).into()),
        Address::IPv6(octets) => IpAddr::V6((*octets).into()),
        Address::Domain(name) => {
            let resolved = phase(timeouts.dns_resolving(), "socks5 dns lookup", async {
                Ok(ctx.dns.resolve(name, IpVersion::V4).await)
            })
            .await;

            match resolved {
                Ok(ResolveOutcome::Resolved(address)) => address,
                Ok(ResolveOutcome::Failed { description }) => {
                    warn!(conn_id, target = %name, "dns lookup failed: {}", description);
                    let _ = send_socks5_response(
                        &mut stream,
                        ReplyCode::HostUnreachable,
                        NO_BIND_ADDRESS,
                        0,
                    )
                    .await;
                    return RemovalReason::UnresolvedTarget;
                }
                Err(e) => {
                    let _ = send_socks5_response(
                        &mut stream,
                        ReplyCode::HostUnreachable,
                        NO_BIND_ADDRESS,
                        0,
                    )
                    .await;
                    return removal_reason_for(&e);
                }
            }
        }
    };

    let limiter = ctx.bandwidth.limiter(
        user_id,
        bandwidth,
        domain_limits.map(|limit| (limit.domain, limit.limits)),
    );
    let transfer_config = TransferConfig {
        chunk_size: ctx.io_chunk_size,
        idle_timeout: timeouts.idle_connection(),
    };

    match request.command {
        Command::Connect => {
            let target_addr = SocketAddr::new(target_ip, request.port);

            let target_stream = match phase(
                timeouts.connect_target(),
                "socks5 connect to target",
                connect_from(ctx.config.out_addr, target_addr),
            )
            .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = send_socks5_response(
                        &mut stream,
                        reply_for_connect_error(&e),
                        NO_BIND_ADDRESS,
                        0,
                    )
                    .await;
                    warn!(conn_id, target = %target_addr, "connect failed: {}", e);
                    return removal_reason_for(&e);
                }
            };

            let local_addr = match target_stream.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = send_socks5_response(
                        &mut stream,
                        ReplyCode::GeneralFailure,
                        NO_BIND_ADDRESS,
                        0,
                    )
                    .await;
                    debug!(conn_id, "no local address for outbound socket: {}", e);
                    return RemovalReason::UnexpectedError;
                }
            };

            if let Err(e) = send_socks5_response(
                &mut stream,
                ReplyCode::Succeeded,
                address_of(local_addr),
                local_addr.port(),
            )
            .await
            {
                return removal_reason_for(&e);
            }

            info!(conn_id, target = %target_addr, "socks5 tunnel established");

            run_transfer(
                stream,
                target_stream,
                limiter,
                transfer_config,
                CancellationToken::new(),
            )
            .await
        }
        Command::Bind => {
            bind_and_bridge(ctx, conn_id, stream, limiter, transfer_config).await
        }
    }
}

/// BIND: listen on an ephemeral port, tell the client where, wait for one
/// inbound connection, report who connected, then bridge it with the client
/// under the same traffic limiter.
async fn bind_and_bridge(
    ctx: &AclContext,
    conn_id: u64,
    mut stream: FirstChunkStream<TcpStream>,
    limiter: crate::bandwidth::TrafficLimiter,
    transfer_config: TransferConfig,
) -> RemovalReason {
    let bind_ip = if ctx.config.out_addr.is_unspecified() {
        IpAddr::V4(ctx.config.in_addr)
    } else {
        ctx.config.out_addr
    };

    let listener = match TcpListener::bind(SocketAddr::new(bind_ip, 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ =
                send_socks5_response(&mut stream, ReplyCode::GeneralFailure, NO_BIND_ADDRESS, 0)
                    .await;
            warn!(conn_id, "bind listener failed: {}", e);
            return RemovalReason::IoError;
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ =
                send_socks5_response(&mut stream, ReplyCode::GeneralFailure, NO_BIND_ADDRESS, 0)
                    .await;
            debug!(conn_id, "no local address for bind listener: {}", e);
            return RemovalReason::UnexpectedError;
        }
    };

    // First reply: where the peer should connect.
    if let Err(e) = send_socks5_response(
        &mut stream,
        ReplyCode::Succeeded,
        address_of(local_addr),
        local_addr.port(),
    )
    .await
    {
        return removal_reason_for(&e);
    }

    info!(conn_id, bind = %local_addr, "socks5 bind listening");

    let accepted =
        tokio::time::timeout(ctx.timeouts.socks_bind(), listener.accept()).await;

    let (inbound, peer) = match accepted {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            let _ =
                send_socks5_response(&mut stream, ReplyCode::GeneralFailure, NO_BIND_ADDRESS, 0)
                    .await;
            warn!(conn_id, "bind accept failed: {}", e);
            return RemovalReason::IoError;
        }
        Err(_) => {
            // Second reply: nobody came.
            let _ = send_socks5_response(&mut stream, ReplyCode::TtlExpired, NO_BIND_ADDRESS, 0)
                .await;
            warn!(conn_id, "bind accept timed out");
            return RemovalReason::CurrentOperationTimedOut;
        }
    };

    if let Err(e) = inbound.set_nodelay(true) {
        debug!(conn_id, "failed to set TCP_NODELAY on inbound socket: {}", e);
    }

    // Second reply: who connected.
    if let Err(e) =
        send_socks5_response(&mut stream, ReplyCode::Succeeded, address_of(peer), peer.port())
            .await
    {
        return removal_reason_for(&e);
    }

    info!(conn_id, peer = %peer, "socks5 bind bridged");

    run_transfer(
        stream,
        inbound,
        limiter,
        transfer_config,
        CancellationToken::new(),
    )
    .await
}
