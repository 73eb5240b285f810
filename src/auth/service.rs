use super::types::{match_site_limit, AuthRequest, AuthResult, FailureReason, UserListSnapshot};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Authorization parameters that arrive with a config snapshot.
#[derive(Debug, Clone)]
struct AuthParams {
    denied_ports: HashSet<u16>,
    failed_auth_delay: Duration,
}

/// Authentication counters.
#[derive(Debug, Default)]
pub struct AuthStats {
    pub successful: AtomicU64,
    pub failed: AtomicU64,
    pub by_login: AtomicU64,
    pub by_ip: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AuthStatsSnapshot {
    pub successful: u64,
    pub failed: u64,
    pub by_login: u64,
    pub by_ip: u64,
}

impl AuthStats {
    pub fn snapshot(&self) -> AuthStatsSnapshot {
        AuthStatsSnapshot {
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            by_login: self.by_login.load(Ordering::Relaxed),
            by_ip: self.by_ip.load(Ordering::Relaxed),
        }
    }
}

/// Authentication and authorization service.
///
/// Holds the current user-list snapshot plus the denied-ports table; both are
/// replaced wholesale (a single pointer swap) when the admin edge installs an
/// update, so `authenticate` never observes a half-updated list.
pub struct AuthService {
    snapshot: RwLock<Arc<UserListSnapshot>>,
    params: RwLock<Arc<AuthParams>>,
    stats: AuthStats,
}

impl AuthService {
    pub fn new(
        user_list: UserListSnapshot,
        denied_ports: impl IntoIterator<Item = u16>,
        failed_auth_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(user_list)),
            params: RwLock::new(Arc::new(AuthParams {
                denied_ports: denied_ports.into_iter().collect(),
                failed_auth_delay,
            })),
            stats: AuthStats::default(),
        })
    }

    /// Replace the user list.
    pub fn install_user_list(&self, user_list: UserListSnapshot) {
        let users = user_list.len();
        *self
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(user_list);
        debug!(users, "user list snapshot installed");
    }

    /// Replace the denied-ports table and the failed-auth delay.
    pub fn install_params(
        &self,
        denied_ports: impl IntoIterator<Item = u16>,
        failed_auth_delay: Duration,
    ) {
        *self.params.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(AuthParams {
            denied_ports: denied_ports.into_iter().collect(),
            failed_auth_delay,
        });
    }

    pub fn stats(&self) -> &AuthStats {
        &self.stats
    }

    pub fn user_count(&self) -> usize {
        self.current_snapshot().len()
    }

    fn current_snapshot(&self) -> Arc<UserListSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_params(&self) -> Arc<AuthParams> {
        self.params
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Authenticate a connection and authorize its target.
    ///
    /// Credentials take precedence over by-IP identification when present.
    /// A miss is answered only after the configured delay, to make online
    /// credential guessing costly.
    pub async fn authenticate(&self, request: AuthRequest) -> AuthResult {
        let snapshot = self.current_snapshot();
        let params = self.current_params();

        let record = match (&request.username, &request.password) {
            (Some(username), Some(password)) => {
                self.stats.by_login.fetch_add(1, Ordering::Relaxed);
                snapshot.find_by_login(request.acl_in_addr, request.acl_port, username, password)
            }
            _ => {
                self.stats.by_ip.fetch_add(1, Ordering::Relaxed);
                snapshot.find_by_ip(request.acl_in_addr, request.acl_port, request.user_ip)
            }
        };

        let record = match record {
            Some(record) => record,
            None => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    acl = %request.acl_in_addr,
                    acl_port = request.acl_port,
                    client = %request.user_ip,
                    "authentication failed: unknown user"
                );
                tokio::time::sleep(params.failed_auth_delay).await;
                return AuthResult::Failed {
                    reason: FailureReason::UnknownUser,
                };
            }
        };

        if params.denied_ports.contains(&request.target_port) {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                user_id = record.user_id,
                target_port = request.target_port,
                "authorization failed: target port blocked"
            );
            return AuthResult::Failed {
                reason: FailureReason::TargetBlocked,
            };
        }

        let domain_limits = match_site_limit(record, &request.target_host);

        self.stats.successful.fetch_add(1, Ordering::Relaxed);
        debug!(
            user_id = record.user_id,
            target = %request.target_host,
            target_port = request.target_port,
            domain_limited = domain_limits.is_some(),
            "authentication successful"
        );

        AuthResult::Successful {
            user_id: record.user_id,
            bandwidth: record.bandwidth,
            domain_limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::{SiteLimit, UserRecord};
    use crate::bandwidth::BandwidthConfig;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    fn service_with_one_user() -> Arc<AuthService> {
        let record = UserRecord {
            user_id: 42,
            acl_in_addr: Ipv4Addr::LOCALHOST,
            acl_port: 3000,
            user_ip: None,
            username: Some("user".to_string()),
            password: Some("12345".to_string()),
            bandwidth: BandwidthConfig {
                inbound: 5120,
                outbound: 5120,
            },
            site_limits: vec![SiteLimit {
                domain: "example.com".to_string(),
                limits: BandwidthConfig {
                    inbound: 100,
                    outbound: 100,
                },
            }],
        };
        AuthService::new(
            UserListSnapshot::new(vec![record]),
            [25u16],
            Duration::from_millis(50),
        )
    }

    fn request(target_host: &str, target_port: u16) -> AuthRequest {
        AuthRequest {
            acl_in_addr: Ipv4Addr::LOCALHOST,
            acl_port: 3000,
            user_ip: Ipv4Addr::new(10, 0, 0, 1),
            username: Some("user".to_string()),
            password: Some("12345".to_string()),
            target_host: target_host.to_string(),
            target_port,
        }
    }

    #[tokio::test]
    async fn known_user_gets_limits_and_domain_match() {
        let service = service_with_one_user();

        match service.authenticate(request("www.example.com", 443)).await {
            AuthResult::Successful {
                user_id,
                bandwidth,
                domain_limits,
            } => {
                assert_eq!(user_id, 42);
                assert_eq!(bandwidth.inbound, 5120);
                assert_eq!(domain_limits.unwrap().domain, "example.com");
            }
            other => panic!("unexpected verdict: {:?}", other),
        }

        assert_eq!(service.stats().snapshot().successful, 1);
    }

    #[tokio::test]
    async fn unknown_user_is_delayed() {
        let service = service_with_one_user();

        let mut bad = request("example.com", 443);
        bad.password = Some("wrong".to_string());

        let started = Instant::now();
        let verdict = service.authenticate(bad).await;
        let elapsed = started.elapsed();

        assert!(matches!(
            verdict,
            AuthResult::Failed {
                reason: FailureReason::UnknownUser
            }
        ));
        assert!(
            elapsed >= Duration::from_millis(50),
            "negative reply came too fast: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn denied_port_blocks_known_user() {
        let service = service_with_one_user();

        let verdict = service.authenticate(request("example.com", 25)).await;
        assert!(matches!(
            verdict,
            AuthResult::Failed {
                reason: FailureReason::TargetBlocked
            }
        ));
    }

    #[tokio::test]
    async fn snapshot_install_replaces_the_user_list() {
        let service = service_with_one_user();

        service.install_user_list(UserListSnapshot::new(Vec::new()));

        let verdict = service.authenticate(request("example.com", 443)).await;
        assert!(matches!(verdict, AuthResult::Failed { .. }));
    }
}
