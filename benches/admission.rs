//! Benchmarks for the admission path
//!
//! This benchmark measures:
//! - Rate limiter permit acquisition
//! - Circuit breaker checks and outcome recording
//! - One request through the full dispatch path with a zero-latency provider

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nl2sql_runtime::providers::SimulatedProvider;
use nl2sql_runtime::resilience::{
    CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig,
};
use nl2sql_runtime::{QueryRequest, QueryService};
use std::sync::Arc;

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    let unlimited = RateLimiter::unlimited();
    group.bench_function("try_acquire_unlimited", |b| {
        b.iter(|| black_box(unlimited.try_acquire()))
    });

    let limited = RateLimiter::new(RateLimiterConfig::new().with_capacity(1024).without_refill());
    group.bench_function("try_acquire_and_refill", |b| {
        b.iter(|| {
            let got = limited.try_acquire();
            limited.refill_one();
            black_box(got)
        })
    });

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    let breaker = CircuitBreaker::new(CircuitBreakerConfig::new().with_max_failures(5));
    group.bench_function("allow_and_record_success", |b| {
        b.iter(|| {
            let allowed = breaker.allow_request();
            breaker.record_success();
            black_box(allowed)
        })
    });

    group.bench_function("snapshot", |b| b.iter(|| black_box(breaker.snapshot())));

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = rt.block_on(async {
        QueryService::builder()
            .workers(4)
            .primary(Arc::new(SimulatedProvider::new("primary")))
            .rate_limiter(Arc::new(RateLimiter::unlimited()))
            .build()
            .unwrap()
    });

    let mut group = c.benchmark_group("dispatch");
    group.bench_function("single_uncached", |b| {
        b.to_async(&rt).iter(|| async {
            let resp = service
                .process(QueryRequest::new("count orders").without_cache())
                .await
                .unwrap();
            black_box(resp)
        })
    });
    group.bench_function("single_cached", |b| {
        b.to_async(&rt).iter(|| async {
            let resp = service.process(QueryRequest::new("count orders")).await.unwrap();
            black_box(resp)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_rate_limiter, bench_circuit_breaker, bench_dispatch);
criterion_main!(benches);
