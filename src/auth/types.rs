use crate::bandwidth::BandwidthConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Per-domain bandwidth cap attached to a user record.
///
/// A pattern of the form `.example.com` matches strictly subdomains; a bare
/// `example.com` matches the domain itself and all subdomains. The longest
/// matching pattern wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteLimit {
    pub domain: String,
    pub limits: BandwidthConfig,
}

/// One user of one ACL, identified either by the client IP or by
/// username/password credentials. IPv4 only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: u64,

    /// ACL listening address the user is allowed to connect to.
    pub acl_in_addr: Ipv4Addr,
    /// ACL listening port the user is allowed to connect to.
    pub acl_port: u16,

    /// Client address, for by-IP identification.
    #[serde(default)]
    pub user_ip: Option<Ipv4Addr>,

    /// Credentials, for by-login identification.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Personal bandwidth limits; zero fields inherit the system defaults.
    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    /// Per-site bandwidth caps.
    #[serde(default)]
    pub site_limits: Vec<SiteLimit>,
}

/// The limit entry matched for the request's target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLimit {
    pub domain: String,
    pub limits: BandwidthConfig,
}

/// Why authentication was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Not in the user list of this ACL.
    UnknownUser,
    /// Known user, but the target port is administratively blocked.
    TargetBlocked,
}

/// One authentication/authorization attempt.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub acl_in_addr: Ipv4Addr,
    pub acl_port: u16,
    pub user_ip: Ipv4Addr,
    pub username: Option<String>,
    pub password: Option<String>,
    pub target_host: String,
    pub target_port: u16,
}

/// Verdict of an authentication attempt.
#[derive(Debug, Clone)]
pub enum AuthResult {
    Failed {
        reason: FailureReason,
    },
    Successful {
        user_id: u64,
        bandwidth: BandwidthConfig,
        domain_limits: Option<DomainLimit>,
    },
}

type ByIpKey = (Ipv4Addr, u16, Ipv4Addr);
type ByLoginKey = (Ipv4Addr, u16, String, String);

/// Immutable view over a user list: the records plus the two lookup indexes.
/// Installed wholesale; readers hold an `Arc` for the duration of a request.
#[derive(Debug, Default)]
pub struct UserListSnapshot {
    records: Vec<UserRecord>,
    by_ip: HashMap<ByIpKey, usize>,
    by_login: HashMap<ByLoginKey, usize>,
}

impl UserListSnapshot {
    pub fn new(records: Vec<UserRecord>) -> Self {
        let mut by_ip = HashMap::new();
        let mut by_login = HashMap::new();

        for (index, record) in records.iter().enumerate() {
            if let Some(user_ip) = record.user_ip {
                by_ip.insert((record.acl_in_addr, record.acl_port, user_ip), index);
            }
            if let (Some(username), Some(password)) = (&record.username, &record.password) {
                by_login.insert(
                    (
                        record.acl_in_addr,
                        record.acl_port,
                        username.clone(),
                        password.clone(),
                    ),
                    index,
                );
            }
        }

        Self {
            records,
            by_ip,
            by_login,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn find_by_login(
        &self,
        acl_in_addr: Ipv4Addr,
        acl_port: u16,
        username: &str,
        password: &str,
    ) -> Option<&UserRecord> {
        self.by_login
            .get(&(
                acl_in_addr,
                acl_port,
                username.to_string(),
                password.to_string(),
            ))
            .map(|&index| &self.records[index])
    }

    pub fn find_by_ip(
        &self,
        acl_in_addr: Ipv4Addr,
        acl_port: u16,
        user_ip: Ipv4Addr,
    ) -> Option<&UserRecord> {
        self.by_ip
            .get(&(acl_in_addr, acl_port, user_ip))
            .map(|&index| &self.records[index])
    }
}

/// Does `pattern` cover `host` under the dot-boundary suffix rules?
pub(crate) fn domain_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('.') {
        // Strictly subdomains.
        host.len() > suffix.len()
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
    } else {
        host == pattern
            || (host.len() > pattern.len()
                && host.ends_with(pattern)
                && host.as_bytes()[host.len() - pattern.len() - 1] == b'.')
    }
}

/// Pick the longest matching site-limit entry for `host`.
pub(crate) fn match_site_limit(record: &UserRecord, host: &str) -> Option<DomainLimit> {
    let host = host.to_ascii_lowercase();

    record
        .site_limits
        .iter()
        .filter(|entry| domain_matches(&entry.domain.to_ascii_lowercase(), &host))
        .max_by_key(|entry| entry.domain.len())
        .map(|entry| DomainLimit {
            domain: entry.domain.clone(),
            limits: entry.limits,
        })
}
