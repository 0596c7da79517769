//! Access key parsing, config loading and event dispatch benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sstunnel::{Config, EventQueue, ServiceConfig};
use std::hint::black_box;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SIP002_KEY: &str =
    "ss://Y2hhY2hhMjAtaWV0Zi1wb2x5MTMwNTpwYXNzd29yZA@example.com:8388#My%20Server";
const LEGACY_KEY: &str = "ss://YWVzLTI1Ni1nY206c2VjcmV0QDE5Mi4xNjguMTAwLjE6ODg4OA#Legacy";
const DYNAMIC_KEY: &str = "ssconf://keys.example.com/v1/abcdef0123456789#outline=1&Office";

const CONFIG_TOML: &str = r#"
[timeouts]
connect_ms = 30000
stop_ms = 10000
probe_ms = 5000
fetch_ms = 20000

[reconnect]
max_retry_attempts = 10
retry_delay_ms = 2000

[fetch]
user_agent = "sstunnel-bench"
accept_invalid_certs = false

[logging]
level = "warn"
"#;

struct Tick(u64);

fn access_key_parsing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("access_key_parsing");

    let keys = vec![
        ("sip002", SIP002_KEY),
        ("legacy", LEGACY_KEY),
        ("dynamic", DYNAMIC_KEY),
    ];

    for (kind, key) in keys {
        group.throughput(Throughput::Bytes(key.len() as u64));
        group.bench_with_input(BenchmarkId::new("parse", kind), key, |b, key| {
            b.iter(|| {
                let config = ServiceConfig::from_str(black_box(key)).unwrap();
                black_box(config);
            });
        });
    }

    group.finish();
}

fn config_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");

    group.bench_function("parse_config", |b| {
        b.iter(|| {
            let config = Config::from_str(black_box(CONFIG_TOML)).unwrap();
            black_box(config);
        });
    });

    group.bench_function("serialize_config", |b| {
        let config = Config::from_str(CONFIG_TOML).unwrap();
        b.iter(|| {
            let serialized = black_box(&config).to_toml().unwrap();
            black_box(serialized);
        });
    });

    group.finish();
}

fn event_dispatch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_dispatch");

    for listeners in [1usize, 8, 32] {
        let queue = EventQueue::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..listeners {
            let seen = seen.clone();
            queue.subscribe(move |tick: &Tick| {
                seen.fetch_add(tick.0 as usize, Ordering::Relaxed);
            });
        }
        queue.start_publishing();

        group.bench_with_input(
            BenchmarkId::new("enqueue", listeners),
            &queue,
            |b, queue| {
                b.iter(|| queue.enqueue(black_box(Tick(1))));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    access_key_parsing_benchmark,
    config_benchmark,
    event_dispatch_benchmark
);
criterion_main!(benches);
