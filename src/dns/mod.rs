mod cache;
mod conductor;
mod interactor;

pub use cache::DnsCache;
pub use conductor::{DnsResolver, DnsResolverConfig, DnsStats, DnsStatsSnapshot, ResolveOutcome};
pub use interactor::{LookupOutcome, NameserverInteractor};

/// Which address family the requester wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}
