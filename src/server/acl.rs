use crate::auth::AuthService;
use crate::bandwidth::BandwidthRegistry;
use crate::config::{AclConfig, TimeoutConfig};
use crate::dns::DnsResolver;
use crate::server::connection::handle_connection;
use crate::server::stats::{AclStats, ConnectionKind, RemovalReason};
use crate::utils::error::Result;
use dashmap::DashMap;
use futures::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a connection handler needs from its ACL.
pub struct AclContext {
    pub config: AclConfig,
    pub timeouts: TimeoutConfig,
    pub io_chunk_size: usize,
    pub auth: Arc<AuthService>,
    pub dns: DnsResolver,
    pub bandwidth: Arc<BandwidthRegistry>,
    pub stats: Arc<AclStats>,
}

impl AclContext {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.config.in_addr, self.config.port)
    }
}

/// One listening endpoint of the proxy.
///
/// Owns the listening socket, hands out per-ACL connection ids, and tracks
/// the live connections so they can be released on shutdown.
pub struct AclListener {
    context: Arc<AclContext>,
    listener: TcpListener,
    live: Arc<DashMap<u64, CancellationToken>>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
}

impl AclListener {
    pub async fn bind(context: Arc<AclContext>, shutdown: CancellationToken) -> Result<Self> {
        let addr = SocketAddr::new(context.config.in_addr.into(), context.config.port);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;

        info!(
            acl = %context.endpoint(),
            protocol = ?context.config.protocol,
            "ACL listening on {}",
            local
        );

        Ok(Self {
            context,
            listener,
            live: Arc::new(DashMap::new()),
            next_connection_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown; release every live connection on the way out.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => Arc::clone(&self).dispatch(stream, peer),
                    Err(e) => {
                        error!(acl = %self.context.endpoint(), "failed to accept connection: {}", e);
                    }
                }
            }
        }

        for entry in self.live.iter() {
            entry.value().cancel();
        }
        debug!(acl = %self.context.endpoint(), "ACL stopped");
    }

    fn dispatch(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.context.stats.inc_connection(ConnectionKind::Generic);

        let cancel = self.shutdown.child_token();
        self.live.insert(conn_id, cancel.clone());

        tokio::spawn(async move {
            debug!(
                conn_id,
                peer = %peer,
                acl = %self.context.endpoint(),
                "connection accepted"
            );

            // A panic inside one handler must not take the worker down.
            let outcome = AssertUnwindSafe(handle_connection(
                &self.context,
                conn_id,
                stream,
                peer,
                cancel,
            ))
            .catch_unwind()
            .await;

            let reason = match outcome {
                Ok(reason) => reason,
                Err(_) => {
                    error!(conn_id, "connection handler panicked");
                    RemovalReason::UnhandledException
                }
            };

            self.live.remove(&conn_id);
            self.context.stats.inc_removal(reason);

            if reason.is_client_side() {
                info!(conn_id, %reason, "connection removed");
            } else {
                warn!(conn_id, %reason, "connection removed");
            }
        });
    }
}
