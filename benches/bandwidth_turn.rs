/// Benchmark: the one-second turn recompute.
///
/// Every user's manager walks its general channel plus every domain entry on
/// each tick, so the recompute cost scales with the number of throttled
/// domains per user.
use arataga::bandwidth::{BandwidthConfig, BandwidthManager};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn manager_with_domains(domains: usize) -> BandwidthManager {
    let mut manager = BandwidthManager::new(
        BandwidthConfig {
            inbound: 5 * 1024,
            outbound: 5 * 1024,
        },
        BandwidthConfig::default(),
    );
    for i in 0..domains {
        manager.make_domain_limits(
            &format!("site-{}.example.com", i),
            BandwidthConfig {
                inbound: 1024,
                outbound: 1024,
            },
        );
    }
    manager
}

fn bench_turn_recompute(c: &mut Criterion) {
    for domains in [0usize, 16, 128] {
        let mut manager = manager_with_domains(domains);
        c.bench_function(&format!("turn_recompute_{}_domains", domains), |b| {
            b.iter(|| {
                manager.update_traffic_counters_for_new_turn();
                black_box(manager.sequence_number())
            });
        });
    }
}

fn bench_domain_attach_detach(c: &mut Criterion) {
    let mut manager = manager_with_domains(64);
    c.bench_function("domain_attach_detach", |b| {
        b.iter(|| {
            manager.make_domain_limits(
                black_box("hot.example.com"),
                BandwidthConfig {
                    inbound: 2048,
                    outbound: 2048,
                },
            );
            manager.connection_removed(black_box("hot.example.com"));
        });
    });
}

criterion_group!(benches, bench_turn_recompute, bench_domain_attach_detach);
criterion_main!(benches);
