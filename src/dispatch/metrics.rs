use crate::cache::CacheStats;
use crate::resilience::circuit_breaker::{CircuitBreakerSnapshot, CircuitState};
use crate::resilience::rate_limiter::RateLimiterSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time facts about the dispatch engine. No policy, just numbers.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub active_workers: usize,
    pub peak_active_workers: usize,
    pub circuit_state: CircuitState,
    /// Permits currently buffered; `None` in unlimited mode.
    pub available_tokens: Option<u32>,
    pub total_requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected_circuit_open: u64,
    pub rejected_rate_limited: u64,
    pub cache_hits: u64,
    pub degraded_responses: u64,
    pub processed_jobs: u64,
    pub uptime_ms: u64,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub cache: CacheStats,
}

#[derive(Default)]
pub(crate) struct DispatchCounters {
    pub total: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub rejected_circuit_open: AtomicU64,
    pub rejected_rate_limited: AtomicU64,
    pub cache_hits: AtomicU64,
    pub degraded: AtomicU64,
}

impl DispatchCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
