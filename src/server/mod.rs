mod acl;
mod connection;
mod http;
mod socks5;
mod stats;
mod transfer;

pub use acl::{AclContext, AclListener};
pub use connection::FirstChunkStream;
pub use stats::{AclStats, AclStatsSnapshot, ConnectionKind, RemovalReason};

use crate::admin::start_admin_server;
use crate::auth::{AuthRequest, AuthResult, AuthService, AuthStatsSnapshot, UserListSnapshot, UserRecord};
use crate::bandwidth::BandwidthRegistry;
use crate::config::{Config, ConfigSnapshot};
use crate::dns::{DnsResolver, DnsResolverConfig, DnsStatsSnapshot, IpVersion, ResolveOutcome};
use crate::utils::error::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The inbound edge the admin entry point drives.
///
/// Snapshot installs replace state wholesale; installing an identical config
/// snapshot is a no-op.
pub struct CoreHandle {
    auth: Arc<AuthService>,
    dns: DnsResolver,
    bandwidth: Arc<BandwidthRegistry>,
    acl_stats: Vec<(String, Arc<AclStats>)>,
    installed: Mutex<Option<ConfigSnapshot>>,
}

impl CoreHandle {
    /// Install the common parameters; returns false when the snapshot is
    /// identical to the one already in effect.
    pub fn install_config_snapshot(&self, snapshot: ConfigSnapshot) -> bool {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        if installed.as_ref() == Some(&snapshot) {
            debug!("config snapshot unchanged, nothing to install");
            return false;
        }

        self.auth.install_params(
            snapshot.denied_ports.iter().copied(),
            Duration::from_millis(snapshot.failed_auth_reply_ms),
        );
        self.bandwidth
            .update_default_limits(snapshot.default_bandwidth);
        self.dns.update_params(
            Duration::from_secs(snapshot.dns_cache_ttl_sec),
            Duration::from_secs(snapshot.dns_cache_cleanup_period_sec),
        );

        info!("config snapshot installed");
        *installed = Some(snapshot);
        true
    }

    /// Replace the user list.
    pub fn install_user_list(&self, users: Vec<UserRecord>) {
        self.auth.install_user_list(UserListSnapshot::new(users));
    }

    pub fn acl_stats(&self) -> Vec<AclStatsSnapshot> {
        self.acl_stats
            .iter()
            .map(|(name, stats)| stats.snapshot(name.clone()))
            .collect()
    }

    pub fn auth_stats(&self) -> AuthStatsSnapshot {
        self.auth.stats().snapshot()
    }

    pub fn dns_stats(&self) -> DnsStatsSnapshot {
        self.dns.stats().snapshot()
    }

    pub fn active_users(&self) -> usize {
        self.bandwidth.user_count()
    }

    pub fn user_list_size(&self) -> usize {
        self.auth.user_count()
    }

    /// One-shot probe returning the same verdict the live path would.
    pub async fn debug_authenticate(&self, request: AuthRequest) -> AuthResult {
        self.auth.authenticate(request).await
    }

    /// One-shot probe through the live resolver (cache included).
    pub async fn debug_dns_resolve(&self, domain: &str, ip_version: IpVersion) -> ResolveOutcome {
        self.dns.resolve(domain, ip_version).await
    }
}

/// The assembled proxy: bandwidth registry and its ticker, DNS subsystem,
/// auth service, one listener per configured ACL, and (optionally) the admin
/// endpoint.
pub struct ProxyServer {
    core: Arc<CoreHandle>,
    bandwidth: Arc<BandwidthRegistry>,
    dns: DnsResolver,
    acls: Vec<Arc<AclListener>>,
    admin_addr: Option<std::net::SocketAddr>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl ProxyServer {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let auth = AuthService::new(
            UserListSnapshot::new(config.users.clone()),
            config.limits.denied_ports.iter().copied(),
            config.timeouts.failed_auth_reply(),
        );

        let (dns, dns_task) = DnsResolver::spawn(DnsResolverConfig {
            nameservers: config.dns.nameservers.clone(),
            cache_ttl: config.dns.cache_ttl(),
            cache_cleanup_period: config.dns.cache_cleanup_period(),
            query_timeout: config.dns.query_timeout(),
            query_attempts: config.dns.query_attempts,
        });

        let bandwidth = BandwidthRegistry::new(config.limits.default_bandwidth);
        let ticker = bandwidth.spawn_ticker();

        let shutdown = CancellationToken::new();

        let mut acls = Vec::with_capacity(config.acls.len());
        let mut acl_stats = Vec::with_capacity(config.acls.len());
        for acl_config in &config.acls {
            let stats = Arc::new(AclStats::default());
            let context = Arc::new(AclContext {
                config: acl_config.clone(),
                timeouts: config.timeouts,
                io_chunk_size: config.io_chunk_size,
                auth: Arc::clone(&auth),
                dns: dns.clone(),
                bandwidth: Arc::clone(&bandwidth),
                stats: Arc::clone(&stats),
            });
            acl_stats.push((context.endpoint(), stats));

            let listener = AclListener::bind(context, shutdown.child_token()).await?;
            acls.push(Arc::new(listener));
        }

        let core = Arc::new(CoreHandle {
            auth,
            dns: dns.clone(),
            bandwidth: Arc::clone(&bandwidth),
            acl_stats,
            installed: Mutex::new(Some(config.as_snapshot())),
        });

        let mut background = vec![dns_task, ticker];
        let mut admin_addr = None;
        if config.admin.enabled {
            let (admin_task, addr) =
                start_admin_server(&config.admin, Arc::clone(&core)).await?;
            background.push(admin_task);
            admin_addr = Some(addr);
        }

        Ok(Self {
            core,
            bandwidth,
            dns,
            acls,
            admin_addr,
            shutdown,
            background,
        })
    }

    pub fn core_handle(&self) -> Arc<CoreHandle> {
        Arc::clone(&self.core)
    }

    /// Actual listening addresses, in ACL configuration order.
    pub fn listen_addrs(&self) -> Result<Vec<std::net::SocketAddr>> {
        self.acls.iter().map(|acl| acl.local_addr()).collect()
    }

    /// Actual admin endpoint address, when the endpoint is enabled.
    pub fn admin_addr(&self) -> Option<std::net::SocketAddr> {
        self.admin_addr
    }

    /// Run every ACL until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Vec::with_capacity(self.acls.len());
        for acl in &self.acls {
            tasks.push(tokio::spawn(Arc::clone(acl).run()));
        }

        futures::future::join_all(tasks).await;

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
        self.bandwidth.shutdown();
        self.dns.shutdown();
        for task in &self.background {
            task.abort();
        }
    }
}
