use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The single terminal classification a connection ends with. Same set for
/// all protocols; surfaced to stats and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    NormalCompletion,
    IoError,
    CurrentOperationTimedOut,
    UnsupportedProtocol,
    ProtocolError,
    UnexpectedError,
    NoActivityForTooLong,
    CurrentOperationCanceled,
    UnhandledException,
    IpVersionMismatch,
    AccessDenied,
    UnresolvedTarget,
    TargetEndBroken,
    UserEndBroken,
    EarlyHttpResponse,
    UserEndClosedByClient,
    HttpNoIncomingRequest,
}

impl RemovalReason {
    pub const ALL: [RemovalReason; 17] = [
        RemovalReason::NormalCompletion,
        RemovalReason::IoError,
        RemovalReason::CurrentOperationTimedOut,
        RemovalReason::UnsupportedProtocol,
        RemovalReason::ProtocolError,
        RemovalReason::UnexpectedError,
        RemovalReason::NoActivityForTooLong,
        RemovalReason::CurrentOperationCanceled,
        RemovalReason::UnhandledException,
        RemovalReason::IpVersionMismatch,
        RemovalReason::AccessDenied,
        RemovalReason::UnresolvedTarget,
        RemovalReason::TargetEndBroken,
        RemovalReason::UserEndBroken,
        RemovalReason::EarlyHttpResponse,
        RemovalReason::UserEndClosedByClient,
        RemovalReason::HttpNoIncomingRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RemovalReason::NormalCompletion => "normal_completion",
            RemovalReason::IoError => "io_error",
            RemovalReason::CurrentOperationTimedOut => "current_operation_timed_out",
            RemovalReason::UnsupportedProtocol => "unsupported_protocol",
            RemovalReason::ProtocolError => "protocol_error",
            RemovalReason::UnexpectedError => "unexpected_error",
            RemovalReason::NoActivityForTooLong => "no_activity_for_too_long",
            RemovalReason::CurrentOperationCanceled => "current_operation_canceled",
            RemovalReason::UnhandledException => "unhandled_exception",
            RemovalReason::IpVersionMismatch => "ip_version_mismatch",
            RemovalReason::AccessDenied => "access_denied",
            RemovalReason::UnresolvedTarget => "unresolved_target",
            RemovalReason::TargetEndBroken => "target_end_broken",
            RemovalReason::UserEndBroken => "user_end_broken",
            RemovalReason::EarlyHttpResponse => "early_http_response",
            RemovalReason::UserEndClosedByClient => "user_end_closed_by_client",
            RemovalReason::HttpNoIncomingRequest => "http_no_incoming_request",
        }
    }

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|reason| *reason == self)
            .expect("reason present in ALL")
    }

    /// Whether the cause is on the client side (logged at a lower level)
    /// rather than a system-side fault.
    pub fn is_client_side(self) -> bool {
        matches!(
            self,
            RemovalReason::NormalCompletion
                | RemovalReason::UnsupportedProtocol
                | RemovalReason::ProtocolError
                | RemovalReason::AccessDenied
                | RemovalReason::UserEndBroken
                | RemovalReason::UserEndClosedByClient
                | RemovalReason::HttpNoIncomingRequest
                | RemovalReason::NoActivityForTooLong
        )
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol counter a connection contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Counted at accept, before the protocol is known.
    Generic,
    Socks5,
    Http,
}

/// Per-ACL connection counters. Single writer per event; read wholesale by
/// the admin endpoint.
#[derive(Debug, Default)]
pub struct AclStats {
    total_connections: AtomicU64,
    socks5_connections: AtomicU64,
    http_connections: AtomicU64,
    removal_reasons: [AtomicU64; RemovalReason::ALL.len()],
}

impl AclStats {
    pub fn inc_connection(&self, kind: ConnectionKind) {
        match kind {
            ConnectionKind::Generic => {
                self.total_connections.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionKind::Socks5 => {
                self.socks5_connections.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionKind::Http => {
                self.http_connections.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn inc_removal(&self, reason: RemovalReason) {
        self.removal_reasons[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn removal_count(&self, reason: RemovalReason) -> u64 {
        self.removal_reasons[reason.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, name: String) -> AclStatsSnapshot {
        let mut removal_reasons = BTreeMap::new();
        for reason in RemovalReason::ALL {
            removal_reasons.insert(
                reason.as_str().to_string(),
                self.removal_count(reason),
            );
        }

        AclStatsSnapshot {
            name,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            socks5_connections: self.socks5_connections.load(Ordering::Relaxed),
            http_connections: self.http_connections.load(Ordering::Relaxed),
            removal_reasons,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AclStatsSnapshot {
    pub name: String,
    pub total_connections: u64,
    pub socks5_connections: u64,
    pub http_connections: u64,
    pub removal_reasons: BTreeMap<String, u64>,
}
