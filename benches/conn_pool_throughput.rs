use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use servcore::config::ConnPoolConfig;
use servcore::core::conn_pool::{ConnHandler, ConnPool, ConnRecord};

struct NoopHandler {
    seen: Arc<AtomicUsize>,
}

impl ConnHandler for NoopHandler {
    fn service(&self, _conn: &mut ConnRecord) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }
}

fn bench_enqueue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("conn_pool_throughput");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_service_cycle", |b| {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(
            ConnPoolConfig {
                min_threads: 4,
                max_threads: 8,
                max_conns: 256,
                thread_idle_timeout_secs: 5,
                max_consecutive_drops: 1000,
                url_stats_cache_size: 64,
            },
            NoopHandler { seen: seen.clone() },
            || {},
        );

        b.iter(|| {
            let before = seen.load(Ordering::Relaxed);
            pool.enqueue(black_box(Box::new(())));
            while seen.load(Ordering::Relaxed) == before {
                std::thread::yield_now();
            }
        });

        pool.stop(Duration::from_secs(5)).unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_enqueue_drain);
criterion_main!(benches);
