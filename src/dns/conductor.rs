use super::cache::{pick_address, DnsCache};
use super::interactor::{LookupOutcome, NameserverInteractor};
use super::IpVersion;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What a resolve request ends with.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Resolved(IpAddr),
    Failed { description: String },
}

/// DNS counters.
#[derive(Debug, Default)]
pub struct DnsStats {
    pub cache_hits: AtomicU64,
    pub successful_lookups: AtomicU64,
    pub failed_lookups: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DnsStatsSnapshot {
    pub cache_hits: u64,
    pub successful_lookups: u64,
    pub failed_lookups: u64,
}

impl DnsStats {
    pub fn snapshot(&self) -> DnsStatsSnapshot {
        DnsStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            successful_lookups: self.successful_lookups.load(Ordering::Relaxed),
            failed_lookups: self.failed_lookups.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DnsResolverConfig {
    pub nameservers: Vec<SocketAddr>,
    pub cache_ttl: Duration,
    pub cache_cleanup_period: Duration,
    pub query_timeout: Duration,
    pub query_attempts: usize,
}

struct Waiter {
    ip_version: IpVersion,
    reply_to: oneshot::Sender<ResolveOutcome>,
}

enum ConductorMessage {
    Resolve {
        domain: String,
        ip_version: IpVersion,
        reply_to: oneshot::Sender<ResolveOutcome>,
    },
    LookupFinished {
        domain: String,
        outcome: LookupOutcome,
    },
    UpdateParams {
        cache_ttl: Duration,
        cache_cleanup_period: Duration,
    },
    ClearCache,
}

/// Handle to the DNS subsystem.
///
/// The cache and the waiting-request map live inside a single conductor task
/// and are only touched there; this handle talks to it through a mailbox.
#[derive(Clone)]
pub struct DnsResolver {
    mailbox: mpsc::Sender<ConductorMessage>,
    stats: Arc<DnsStats>,
    shutdown: CancellationToken,
}

impl DnsResolver {
    pub fn spawn(config: DnsResolverConfig) -> (Self, JoinHandle<()>) {
        let (mailbox, inbox) = mpsc::channel(1024);
        let stats = Arc::new(DnsStats::default());
        let shutdown = CancellationToken::new();

        let resolver = Self {
            mailbox: mailbox.clone(),
            stats: Arc::clone(&stats),
            shutdown: shutdown.clone(),
        };

        let conductor = Conductor {
            cache: DnsCache::new(),
            waiting: HashMap::new(),
            interactor: Arc::new(NameserverInteractor::new(
                config.nameservers,
                config.query_timeout,
                config.query_attempts,
            )),
            cache_ttl: config.cache_ttl,
            cache_cleanup_period: config.cache_cleanup_period,
            mailbox,
            stats,
            shutdown,
        };

        let handle = tokio::spawn(conductor.run(inbox));

        (resolver, handle)
    }

    /// Resolve `domain` to one address of the requested family.
    ///
    /// Concurrent requests for the same name are coalesced into a single
    /// nameserver lookup; every requester gets its own reply.
    pub async fn resolve(&self, domain: &str, ip_version: IpVersion) -> ResolveOutcome {
        let (reply_to, reply) = oneshot::channel();

        let sent = self
            .mailbox
            .send(ConductorMessage::Resolve {
                domain: domain.to_string(),
                ip_version,
                reply_to,
            })
            .await;

        if sent.is_err() {
            return ResolveOutcome::Failed {
                description: "dns resolver is not running".to_string(),
            };
        }

        match reply.await {
            Ok(outcome) => outcome,
            Err(_) => ResolveOutcome::Failed {
                description: "dns resolver dropped the request".to_string(),
            },
        }
    }

    /// Install new cache parameters from a config snapshot.
    pub fn update_params(&self, cache_ttl: Duration, cache_cleanup_period: Duration) {
        let _ = self.mailbox.try_send(ConductorMessage::UpdateParams {
            cache_ttl,
            cache_cleanup_period,
        });
    }

    pub fn clear_cache(&self) {
        let _ = self.mailbox.try_send(ConductorMessage::ClearCache);
    }

    pub fn stats(&self) -> &DnsStats {
        &self.stats
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

struct Conductor {
    cache: DnsCache,
    waiting: HashMap<String, Vec<Waiter>>,
    interactor: Arc<NameserverInteractor>,
    cache_ttl: Duration,
    cache_cleanup_period: Duration,
    mailbox: mpsc::Sender<ConductorMessage>,
    stats: Arc<DnsStats>,
    shutdown: CancellationToken,
}

impl Conductor {
    async fn run(mut self, mut inbox: mpsc::Receiver<ConductorMessage>) {
        let mut sweep = tokio::time::interval(self.cache_cleanup_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    let removed = self.cache.remove_outdated(self.cache_ttl);
                    if removed > 0 {
                        trace!(removed, "dns cache sweep");
                    }
                }
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    match message {
                        ConductorMessage::Resolve { domain, ip_version, reply_to } => {
                            self.on_resolve(domain, ip_version, reply_to);
                        }
                        ConductorMessage::LookupFinished { domain, outcome } => {
                            self.on_lookup_finished(domain, outcome);
                        }
                        ConductorMessage::UpdateParams { cache_ttl, cache_cleanup_period } => {
                            self.cache_ttl = cache_ttl;
                            if cache_cleanup_period != self.cache_cleanup_period {
                                self.cache_cleanup_period = cache_cleanup_period;
                                sweep = tokio::time::interval(cache_cleanup_period);
                                sweep.set_missed_tick_behavior(
                                    tokio::time::MissedTickBehavior::Delay);
                            }
                        }
                        ConductorMessage::ClearCache => {
                            self.cache.clear();
                        }
                    }
                }
            }
        }
        debug!("dns conductor stopped");
    }

    fn on_resolve(
        &mut self,
        domain: String,
        ip_version: IpVersion,
        reply_to: oneshot::Sender<ResolveOutcome>,
    ) {
        // Direct IP literals bypass the whole machinery.
        if let Ok(address) = domain.parse::<IpAddr>() {
            let outcome = match pick_address(&[address], ip_version) {
                Some(address) => ResolveOutcome::Resolved(address),
                None => ResolveOutcome::Failed {
                    description: format!(
                        "'{}' is not of the requested address family",
                        domain
                    ),
                },
            };
            let _ = reply_to.send(outcome);
            return;
        }

        if let Some(address) = self.cache.resolve(&domain, ip_version, self.cache_ttl) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(domain, %address, "resolved from cache");
            let _ = reply_to.send(ResolveOutcome::Resolved(address));
            return;
        }

        let waiter = Waiter {
            ip_version,
            reply_to,
        };

        // A lookup for this name is already in flight: just join the queue.
        if let Some(waiters) = self.waiting.get_mut(&domain) {
            waiters.push(waiter);
            return;
        }

        self.waiting.insert(domain.clone(), vec![waiter]);

        let interactor = Arc::clone(&self.interactor);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let outcome = interactor.lookup(&domain).await;
            let _ = mailbox
                .send(ConductorMessage::LookupFinished { domain, outcome })
                .await;
        });
    }

    fn on_lookup_finished(&mut self, domain: String, outcome: LookupOutcome) {
        let waiters = self.waiting.remove(&domain).unwrap_or_default();

        match outcome {
            LookupOutcome::Successful { addresses } => {
                self.stats
                    .successful_lookups
                    .fetch_add(1, Ordering::Relaxed);
                self.cache.add(domain.clone(), addresses.clone());

                for waiter in waiters {
                    let outcome = match pick_address(&addresses, waiter.ip_version) {
                        Some(address) => ResolveOutcome::Resolved(address),
                        None => ResolveOutcome::Failed {
                            description: format!(
                                "no address of the requested family for '{}'",
                                domain
                            ),
                        },
                    };
                    let _ = waiter.reply_to.send(outcome);
                }
            }
            LookupOutcome::Failed { description } => {
                self.stats.failed_lookups.fetch_add(1, Ordering::Relaxed);
                warn!(domain, error = %description, "lookup failed, notifying waiters");

                // Failures are not cached: the next request retries.
                for waiter in waiters {
                    let _ = waiter.reply_to.send(ResolveOutcome::Failed {
                        description: description.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config(nameservers: Vec<SocketAddr>) -> DnsResolverConfig {
        DnsResolverConfig {
            nameservers,
            cache_ttl: Duration::from_secs(60),
            cache_cleanup_period: Duration::from_secs(30),
            query_timeout: Duration::from_millis(200),
            query_attempts: 1,
        }
    }

    #[tokio::test]
    async fn ip_literals_are_answered_without_lookup() {
        let (resolver, _handle) = DnsResolver::spawn(test_config(vec![]));

        match resolver.resolve("127.0.0.1", IpVersion::V4).await {
            ResolveOutcome::Resolved(address) => {
                assert_eq!(address, IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            ResolveOutcome::Failed { description } => panic!("failed: {}", description),
        }

        // No nameservers are configured, so a real lookup would have failed;
        // the literal must not touch the interactor counters.
        assert_eq!(resolver.stats().snapshot().failed_lookups, 0);
    }

    #[tokio::test]
    async fn v6_literal_for_v4_request_fails() {
        let (resolver, _handle) = DnsResolver::spawn(test_config(vec![]));

        let outcome = resolver.resolve("::1", IpVersion::V4).await;
        assert!(matches!(outcome, ResolveOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn failed_lookups_are_not_cached() {
        // Nothing listens on the discard port, so every lookup fails.
        let (resolver, _handle) =
            DnsResolver::spawn(test_config(vec!["127.0.0.1:9".parse().unwrap()]));

        let first = resolver.resolve("no.such.host.invalid", IpVersion::V4).await;
        assert!(matches!(first, ResolveOutcome::Failed { .. }));

        let second = resolver.resolve("no.such.host.invalid", IpVersion::V4).await;
        assert!(matches!(second, ResolveOutcome::Failed { .. }));

        // Both requests went upstream.
        assert_eq!(resolver.stats().snapshot().failed_lookups, 2);
    }
}
