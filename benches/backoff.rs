use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use recast::{BackoffStrategy, CircuitBreaker, CircuitBreakerPolicy, RetryPolicy};

fn strategies() -> Vec<BackoffStrategy> {
    let base = Duration::from_millis(100);
    let cap = Duration::from_secs(10);
    vec![
        BackoffStrategy::linear(base),
        BackoffStrategy::constant(base),
        BackoffStrategy::exponential(base, cap),
        BackoffStrategy::equal_jitter(base, cap),
        BackoffStrategy::full_jitter(base, cap),
        BackoffStrategy::decorrelated_jitter(base, cap),
    ]
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    for strategy in strategies() {
        group.bench_with_input(
            BenchmarkId::from_parameter(strategy.name()),
            &strategy,
            |b, strategy| {
                b.iter(|| {
                    let mut backoff = strategy.start();
                    for attempt in 1..=8 {
                        black_box(backoff.next(black_box(attempt)));
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let breaker = Arc::new(CircuitBreaker::new(
        "bench",
        CircuitBreakerPolicy::standard().request_volume_threshold(usize::MAX),
    ));
    c.bench_function("circuit_breaker/admit_and_record", |b| {
        b.iter(|| {
            if let Ok(attempt) = breaker.begin() {
                attempt.mark_success();
            }
        });
    });
}

fn bench_retry_policy(c: &mut Criterion) {
    let policy = RetryPolicy::standard()
        .retry_when_too_many_requests()
        .retry_when_internal_server_error();
    c.bench_function("retry_policy/no_outcome", |b| {
        b.iter(|| black_box(policy.should_retry(None, None)));
    });
}

criterion_group!(
    benches,
    bench_backoff,
    bench_circuit_breaker,
    bench_retry_policy
);
criterion_main!(benches);
