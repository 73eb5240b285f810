use super::IpVersion;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

struct CacheEntry {
    addresses: Vec<IpAddr>,
    created_at: Instant,
}

impl CacheEntry {
    fn is_outdated(&self, time_to_live: Duration) -> bool {
        self.created_at.elapsed() >= time_to_live
    }
}

/// Local cache of resolved names.
///
/// Owned by the conductor; all access is serialized there. An entry keeps
/// every address returned for a name, and the requested family is selected
/// at lookup time.
#[derive(Default)]
pub struct DnsCache {
    entries: HashMap<String, CacheEntry>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a fresh entry for `name` and pick an address of the requested
    /// family. A name whose entry has outlived `time_to_live` is treated as
    /// absent (the periodic sweep will collect it).
    pub fn resolve(
        &self,
        name: &str,
        ip_version: IpVersion,
        time_to_live: Duration,
    ) -> Option<IpAddr> {
        let entry = self.entries.get(name)?;
        if entry.is_outdated(time_to_live) {
            return None;
        }
        pick_address(&entry.addresses, ip_version)
    }

    /// Store all addresses resolved for `name`, replacing any previous entry.
    pub fn add(&mut self, name: String, addresses: Vec<IpAddr>) {
        self.entries.insert(
            name,
            CacheEntry {
                addresses,
                created_at: Instant::now(),
            },
        );
    }

    /// Drop entries older than `time_to_live`; returns how many went away.
    pub fn remove_outdated(&mut self, time_to_live: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_outdated(time_to_live));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Choose an address of the requested family from a resolved list, falling
/// back to an IPv4-mapped IPv6 address when only IPv4 is known.
pub(crate) fn pick_address(addresses: &[IpAddr], ip_version: IpVersion) -> Option<IpAddr> {
    match ip_version {
        IpVersion::V4 => addresses.iter().find(|a| a.is_ipv4()).copied(),
        IpVersion::V6 => addresses
            .iter()
            .find(|a| a.is_ipv6())
            .copied()
            .or_else(|| {
                addresses.iter().find_map(|a| match a {
                    IpAddr::V4(v4) => Some(IpAddr::V6(v4.to_ipv6_mapped())),
                    IpAddr::V6(_) => None,
                })
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn resolves_fresh_entries_only() {
        let mut cache = DnsCache::new();
        cache.add(
            "example.com".to_string(),
            vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))],
        );

        assert!(cache
            .resolve("example.com", IpVersion::V4, TTL)
            .is_some());
        assert!(cache.resolve("example.com", IpVersion::V4, Duration::ZERO).is_none());
        assert!(cache.resolve("other.com", IpVersion::V4, TTL).is_none());
    }

    #[test]
    fn sweep_removes_only_outdated_entries() {
        let mut cache = DnsCache::new();
        cache.add(
            "a.example".to_string(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        );
        cache.add(
            "b.example".to_string(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        );

        assert_eq!(cache.remove_outdated(TTL), 0);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.remove_outdated(Duration::ZERO), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn version_selection_prefers_native_family() {
        let addresses = vec![
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];

        assert_eq!(
            pick_address(&addresses, IpVersion::V4),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(
            pick_address(&addresses, IpVersion::V6),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
    }

    #[test]
    fn v6_request_falls_back_to_mapped_v4() {
        let addresses = vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))];

        let picked = pick_address(&addresses, IpVersion::V6).unwrap();
        assert_eq!(
            picked,
            IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped())
        );

        let only_v6 = vec![IpAddr::V6(Ipv6Addr::LOCALHOST)];
        assert!(pick_address(&only_v6, IpVersion::V4).is_none());
    }
}
