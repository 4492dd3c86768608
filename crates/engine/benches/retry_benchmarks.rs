use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rebound_core::{AggregateId, EventId};
use rebound_events::EventEnvelope;

use rebound_engine::{InMemoryRetryStore, RetryPolicy, RetryRecord, RetryStore};

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let policy = RetryPolicy::exponential(20, Duration::from_millis(100), Duration::from_secs(60));

    group.bench_function("delay_for_attempt", |b| {
        b.iter(|| {
            for attempt in 1..=20 {
                black_box(policy.delay_for_attempt(black_box(attempt)));
            }
        })
    });

    group.bench_function("next_delay_jittered", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| {
            for attempt in 1..=20 {
                black_box(policy.next_delay_with(black_box(attempt), &mut rng));
            }
        })
    });

    group.finish();
}

fn populated_store(records: usize) -> InMemoryRetryStore {
    let store = InMemoryRetryStore::new();
    let now = Utc::now();
    for i in 0..records {
        let event = EventEnvelope::new(
            EventId::new(),
            "order.placed",
            AggregateId::new(),
            serde_json::json!({"n": i}),
        );
        let mut record = RetryRecord::new(&event, 5, now);
        record.record_attempt(now);
        // Half due now, half an hour out.
        let offset = if i % 2 == 0 { 0 } else { 1800 };
        record.schedule_retry(now + chrono::Duration::seconds(offset));
        store.save(&record).unwrap();
    }
    store
}

fn bench_claim_due(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_due");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || populated_store(size),
                |store| {
                    let claimed = store
                        .claim_due(Utc::now(), Duration::from_secs(60), 100)
                        .unwrap();
                    black_box(claimed.len())
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_statistics(c: &mut Criterion) {
    let store = populated_store(10_000);
    c.bench_function("statistics_10k", |b| {
        b.iter(|| black_box(store.get_statistics().unwrap()))
    });
}

criterion_group!(benches, bench_backoff, bench_claim_due, bench_statistics);
criterion_main!(benches);
