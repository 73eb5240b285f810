use crate::auth::UserRecord;
use crate::bandwidth::BandwidthConfig;
use crate::utils::error::{AratagaError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of I/O worker threads; 0 picks `max(1, cpu_count - 2)`.
    #[serde(default)]
    pub io_threads: usize,

    /// Size of the intermediate data-transfer buffer, bytes.
    #[serde(default = "default_io_chunk_size")]
    pub io_chunk_size: usize,

    #[serde(default)]
    pub acls: Vec<AclConfig>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub users: Vec<UserRecord>,
}

/// Which client protocols one ACL accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclProtocol {
    Auto,
    Socks5,
    Http,
}

impl Default for AclProtocol {
    fn default() -> Self {
        AclProtocol::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclConfig {
    #[serde(default)]
    pub protocol: AclProtocol,

    /// Address clients connect to.
    pub in_addr: Ipv4Addr,
    /// Port clients connect to.
    pub port: u16,

    /// Source address for outbound connections of this ACL.
    #[serde(default = "default_out_addr")]
    pub out_addr: IpAddr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_protocol_detection_ms")]
    pub protocol_detection_ms: u64,
    #[serde(default = "default_socks_handshake_phase_ms")]
    pub socks_handshake_phase_ms: u64,
    #[serde(default = "default_socks_bind_ms")]
    pub socks_bind_ms: u64,
    #[serde(default = "default_connect_target_ms")]
    pub connect_target_ms: u64,
    #[serde(default = "default_http_headers_complete_ms")]
    pub http_headers_complete_ms: u64,
    #[serde(default = "default_http_negative_response_ms")]
    pub http_negative_response_ms: u64,
    #[serde(default = "default_idle_connection_ms")]
    pub idle_connection_ms: u64,
    #[serde(default = "default_authentification_ms")]
    pub authentification_ms: u64,
    #[serde(default = "default_dns_resolving_ms")]
    pub dns_resolving_ms: u64,
    #[serde(default = "default_failed_auth_reply_ms")]
    pub failed_auth_reply_ms: u64,
}

impl TimeoutConfig {
    pub fn protocol_detection(&self) -> Duration {
        Duration::from_millis(self.protocol_detection_ms)
    }
    pub fn socks_handshake_phase(&self) -> Duration {
        Duration::from_millis(self.socks_handshake_phase_ms)
    }
    pub fn socks_bind(&self) -> Duration {
        Duration::from_millis(self.socks_bind_ms)
    }
    pub fn connect_target(&self) -> Duration {
        Duration::from_millis(self.connect_target_ms)
    }
    pub fn http_headers_complete(&self) -> Duration {
        Duration::from_millis(self.http_headers_complete_ms)
    }
    pub fn http_negative_response(&self) -> Duration {
        Duration::from_millis(self.http_negative_response_ms)
    }
    pub fn idle_connection(&self) -> Duration {
        Duration::from_millis(self.idle_connection_ms)
    }
    pub fn authentification(&self) -> Duration {
        Duration::from_millis(self.authentification_ms)
    }
    pub fn dns_resolving(&self) -> Duration {
        Duration::from_millis(self.dns_resolving_ms)
    }
    pub fn failed_auth_reply(&self) -> Duration {
        Duration::from_millis(self.failed_auth_reply_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<SocketAddr>,
    #[serde(default = "default_dns_cache_ttl_sec")]
    pub cache_ttl_sec: u64,
    #[serde(default = "default_dns_cache_cleanup_period_sec")]
    pub cache_cleanup_period_sec: u64,
    #[serde(default = "default_dns_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_dns_query_attempts")]
    pub query_attempts: usize,
}

impl DnsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_sec)
    }
    pub fn cache_cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_period_sec)
    }
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimitsConfig {
    /// System-wide default bandwidth limits; personal zeros inherit these.
    #[serde(default)]
    pub default_bandwidth: BandwidthConfig,

    /// Target ports no user may connect to.
    #[serde(default)]
    pub denied_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

/// Runtime-installable common parameters (the admin edge's
/// install-config-snapshot payload). Listener creation/teardown is not done
/// here; only parameter installation is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub default_bandwidth: BandwidthConfig,
    #[serde(default)]
    pub denied_ports: Vec<u16>,
    #[serde(default = "default_failed_auth_reply_ms")]
    pub failed_auth_reply_ms: u64,
    #[serde(default = "default_dns_cache_ttl_sec")]
    pub dns_cache_ttl_sec: u64,
    #[serde(default = "default_dns_cache_cleanup_period_sec")]
    pub dns_cache_cleanup_period_sec: u64,
}

// Default values
fn default_io_chunk_size() -> usize {
    1024
}

fn default_out_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_protocol_detection_ms() -> u64 {
    3_000
}

fn default_socks_handshake_phase_ms() -> u64 {
    5_000
}

fn default_socks_bind_ms() -> u64 {
    20_000
}

fn default_connect_target_ms() -> u64 {
    5_000
}

fn default_http_headers_complete_ms() -> u64 {
    5_000
}

fn default_http_negative_response_ms() -> u64 {
    2_000
}

fn default_idle_connection_ms() -> u64 {
    300_000
}

fn default_authentification_ms() -> u64 {
    1_500
}

fn default_dns_resolving_ms() -> u64 {
    4_000
}

fn default_failed_auth_reply_ms() -> u64 {
    750
}

fn default_nameservers() -> Vec<SocketAddr> {
    vec![
        "8.8.8.8:53".parse().expect("valid literal"),
        "1.1.1.1:53".parse().expect("valid literal"),
    ]
}

fn default_dns_cache_ttl_sec() -> u64 {
    240
}

fn default_dns_cache_cleanup_period_sec() -> u64 {
    30
}

fn default_dns_query_timeout_ms() -> u64 {
    1_200
}

fn default_dns_query_attempts() -> usize {
    2
}

fn default_admin_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8088
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            protocol_detection_ms: default_protocol_detection_ms(),
            socks_handshake_phase_ms: default_socks_handshake_phase_ms(),
            socks_bind_ms: default_socks_bind_ms(),
            connect_target_ms: default_connect_target_ms(),
            http_headers_complete_ms: default_http_headers_complete_ms(),
            http_negative_response_ms: default_http_negative_response_ms(),
            idle_connection_ms: default_idle_connection_ms(),
            authentification_ms: default_authentification_ms(),
            dns_resolving_ms: default_dns_resolving_ms(),
            failed_auth_reply_ms: default_failed_auth_reply_ms(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: default_nameservers(),
            cache_ttl_sec: default_dns_cache_ttl_sec(),
            cache_cleanup_period_sec: default_dns_cache_cleanup_period_sec(),
            query_timeout_ms: default_dns_query_timeout_ms(),
            query_attempts: default_dns_query_attempts(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_admin_bind_address(),
            port: default_admin_port(),
            token: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_threads: 0,
            io_chunk_size: default_io_chunk_size(),
            acls: Vec::new(),
            timeouts: TimeoutConfig::default(),
            dns: DnsConfig::default(),
            limits: LimitsConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AratagaError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| AratagaError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.acls.is_empty() {
            return Err(AratagaError::Config(
                "At least one ACL must be configured".to_string(),
            ));
        }

        let mut endpoints = std::collections::HashSet::new();
        for acl in &self.acls {
            if !endpoints.insert((acl.in_addr, acl.port)) {
                return Err(AratagaError::Config(format!(
                    "Duplicate ACL endpoint {}:{}",
                    acl.in_addr, acl.port
                )));
            }
        }

        if self.io_chunk_size == 0 {
            return Err(AratagaError::Config(
                "io_chunk_size cannot be zero".to_string(),
            ));
        }

        if self.dns.nameservers.is_empty() {
            return Err(AratagaError::Config(
                "At least one nameserver must be configured".to_string(),
            ));
        }

        if self.admin.enabled && self.admin.token.trim().is_empty() {
            return Err(AratagaError::Config(
                "Admin endpoint requires a non-empty token".to_string(),
            ));
        }

        for user in &self.users {
            let by_ip = user.user_ip.is_some();
            let by_login = user.username.is_some() && user.password.is_some();
            if !by_ip && !by_login {
                return Err(AratagaError::Config(format!(
                    "User {} needs either user_ip or username+password",
                    user.user_id
                )));
            }
        }

        Ok(())
    }

    /// The number of worker threads to run the I/O on.
    pub fn effective_io_threads(&self) -> usize {
        if self.io_threads > 0 {
            self.io_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(2))
                .unwrap_or(1)
                .max(1)
        }
    }

    /// The common parameters as a runtime snapshot.
    pub fn as_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            default_bandwidth: self.limits.default_bandwidth,
            denied_ports: self.limits.denied_ports.clone(),
            failed_auth_reply_ms: self.timeouts.failed_auth_reply_ms,
            dns_cache_ttl_sec: self.dns.cache_ttl_sec,
            dns_cache_cleanup_period_sec: self.dns.cache_cleanup_period_sec,
        }
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"io_threads = 0        # 0 = max(1, cpu_count - 2)
io_chunk_size = 1024  # data-transfer buffer, bytes

[[acls]]
protocol = "auto"     # Options: "auto", "socks5", "http"
in_addr = "127.0.0.1"
port = 3000
out_addr = "0.0.0.0"

[timeouts]
protocol_detection_ms = 3000
socks_handshake_phase_ms = 5000
socks_bind_ms = 20000
connect_target_ms = 5000
http_headers_complete_ms = 5000
http_negative_response_ms = 2000
idle_connection_ms = 300000
authentification_ms = 1500
dns_resolving_ms = 4000
failed_auth_reply_ms = 750

[dns]
nameservers = ["8.8.8.8:53", "1.1.1.1:53"]
cache_ttl_sec = 240
cache_cleanup_period_sec = 30
query_timeout_ms = 1200
query_attempts = 2

[limits]
denied_ports = [25]

[limits.default_bandwidth]
inbound = 0   # bytes/sec, 0 = unlimited
outbound = 0

[admin]
enabled = false
bind_address = "127.0.0.1"
port = 8088
token = ""

[logging]
level = "info"    # Options: "trace", "debug", "info", "warn", "error"
format = "pretty" # Options: "pretty", "json"

# [[users]]
# user_id = 1
# acl_in_addr = "127.0.0.1"
# acl_port = 3000
# username = "alice"
# password = "secret123"
# bandwidth = { inbound = 0, outbound = 0 }
# site_limits = [{ domain = "example.com", limits = { inbound = 5120, outbound = 5120 } }]
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| AratagaError::Config(format!("Failed to write example config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_one_acl() -> Config {
        Config {
            acls: vec![AclConfig {
                protocol: AclProtocol::Auto,
                in_addr: Ipv4Addr::LOCALHOST,
                port: 3000,
                out_addr: default_out_addr(),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn default_config_needs_an_acl() {
        assert!(Config::default().validate().is_err());
        assert!(config_with_one_acl().validate().is_ok());
    }

    #[test]
    fn duplicate_acl_endpoints_are_rejected() {
        let mut config = config_with_one_acl();
        config.acls.push(config.acls[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn admin_needs_a_token() {
        let mut config = config_with_one_acl();
        config.admin.enabled = true;
        assert!(config.validate().is_err());

        config.admin.token = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn example_config_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arataga.toml");

        Config::create_example(&path).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.io_chunk_size, 1024);
        assert_eq!(config.acls.len(), 1);
        assert_eq!(config.acls[0].port, 3000);
        assert_eq!(config.timeouts.failed_auth_reply_ms, 750);
    }

    #[test]
    fn user_record_requires_an_identity() {
        let mut config = config_with_one_acl();
        config.users.push(UserRecord {
            user_id: 1,
            acl_in_addr: Ipv4Addr::LOCALHOST,
            acl_port: 3000,
            user_ip: None,
            username: Some("alice".to_string()),
            password: None,
            bandwidth: BandwidthConfig::default(),
            site_limits: Vec::new(),
        });
        assert!(config.validate().is_err());

        config.users[0].password = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn snapshot_mirrors_common_parameters() {
        let mut config = config_with_one_acl();
        config.limits.denied_ports = vec![25, 465];

        let snapshot = config.as_snapshot();
        assert_eq!(snapshot.denied_ports, vec![25, 465]);
        assert_eq!(snapshot.dns_cache_ttl_sec, 240);
    }
}
