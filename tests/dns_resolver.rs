//! DNS conductor behavior: request coalescing, caching, failure delivery.

mod common;

use arataga::dns::{DnsResolver, DnsResolverConfig, IpVersion, ResolveOutcome};
use common::*;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn resolver_config(dns_addr: std::net::SocketAddr) -> DnsResolverConfig {
    DnsResolverConfig {
        nameservers: vec![dns_addr],
        cache_ttl: Duration::from_secs(60),
        cache_cleanup_period: Duration::from_secs(30),
        query_timeout: Duration::from_millis(500),
        query_attempts: 1,
    }
}

#[tokio::test]
async fn concurrent_lookups_for_one_name_are_coalesced() {
    // The answer is delayed so all ten requests pile up behind one query.
    let dns = spawn_fake_dns(Ipv4Addr::new(10, 1, 2, 3), Duration::from_millis(300)).await;
    let (resolver, _task) = DnsResolver::spawn(resolver_config(dns.addr));

    let lookups = (0..10).map(|_| {
        let resolver = resolver.clone();
        async move { resolver.resolve("example.com", IpVersion::V4).await }
    });
    let outcomes = futures::future::join_all(lookups).await;

    for outcome in outcomes {
        match outcome {
            ResolveOutcome::Resolved(address) => {
                assert_eq!(address, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
            }
            ResolveOutcome::Failed { description } => panic!("lookup failed: {}", description),
        }
    }

    // Exactly one outbound A query for all ten requesters.
    assert_eq!(dns.a_queries.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.stats().snapshot().successful_lookups, 1);
}

#[tokio::test]
async fn second_round_is_served_from_the_cache() {
    let dns = spawn_fake_dns(Ipv4Addr::new(10, 1, 2, 3), Duration::ZERO).await;
    let (resolver, _task) = DnsResolver::spawn(resolver_config(dns.addr));

    let first = resolver.resolve("cached.example", IpVersion::V4).await;
    assert!(matches!(first, ResolveOutcome::Resolved(_)));
    let queries_after_first = dns.a_queries.load(Ordering::SeqCst);

    let second = resolver.resolve("cached.example", IpVersion::V4).await;
    assert!(matches!(second, ResolveOutcome::Resolved(_)));

    assert_eq!(dns.a_queries.load(Ordering::SeqCst), queries_after_first);
    assert_eq!(resolver.stats().snapshot().cache_hits, 1);
}

#[tokio::test]
async fn expired_entries_trigger_a_fresh_lookup() {
    let dns = spawn_fake_dns(Ipv4Addr::new(10, 1, 2, 3), Duration::ZERO).await;
    let mut config = resolver_config(dns.addr);
    config.cache_ttl = Duration::from_millis(100);
    let (resolver, _task) = DnsResolver::spawn(config);

    resolver.resolve("short.example", IpVersion::V4).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    resolver.resolve("short.example", IpVersion::V4).await;

    assert_eq!(dns.a_queries.load(Ordering::SeqCst), 2);
    assert_eq!(resolver.stats().snapshot().cache_hits, 0);
}

#[tokio::test]
async fn coalesced_failure_reaches_every_waiter() {
    // A nameserver that never answers.
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = socket.local_addr().unwrap();
    std::mem::forget(socket);

    let mut config = resolver_config(dead_addr);
    config.query_timeout = Duration::from_millis(150);
    let (resolver, _task) = DnsResolver::spawn(config);

    let lookups = (0..5).map(|_| {
        let resolver = resolver.clone();
        async move { resolver.resolve("silent.example", IpVersion::V4).await }
    });
    let outcomes = futures::future::join_all(lookups).await;

    for outcome in outcomes {
        assert!(matches!(outcome, ResolveOutcome::Failed { .. }));
    }

    // One upstream attempt covered all five waiters.
    assert_eq!(resolver.stats().snapshot().failed_lookups, 1);
}

#[tokio::test]
async fn clear_cache_forgets_resolved_names() {
    let dns = spawn_fake_dns(Ipv4Addr::new(10, 1, 2, 3), Duration::ZERO).await;
    let (resolver, _task) = DnsResolver::spawn(resolver_config(dns.addr));

    resolver.resolve("cleared.example", IpVersion::V4).await;
    resolver.clear_cache();
    // Give the conductor a moment to process the mailbox message.
    tokio::time::sleep(Duration::from_millis(100)).await;
    resolver.resolve("cleared.example", IpVersion::V4).await;

    assert_eq!(dns.a_queries.load(Ordering::SeqCst), 2);
}
