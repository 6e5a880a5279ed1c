use super::metrics::{DispatchCounters, DispatchMetrics};
use super::processor::{DispatchJob, ProcessorDeps, QueryHandler, QueryProcessor};
use crate::batch::BatchReport;
use crate::config::{AdmissionMode, DispatchConfig};
use crate::context::RequestContext;
use crate::pool::object_pool::ObjectPool;
use crate::pool::worker_pool::{JobResult, JobTicket, QueueFullPolicy, ShutdownMode, WorkerPool};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::rate_limiter::RateLimiter;
use crate::streaming::session::ProgressReporter;
use crate::types::{QueryRequest, QueryResponse};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Extra time allowed past the request deadline for the worker to write the
/// job's result slot (it enforces the same deadline on its side).
const SLOT_GRACE: Duration = Duration::from_millis(250);

/// Admission control plus execution for every request.
///
/// Per request: circuit breaker check, rate-limit permit, job submission to
/// the worker pool, result-slot wait, then the outcome is fed back to the
/// breaker. Only outcomes of jobs that actually ran count towards the
/// breaker, and only errors for which [`Error::trips_breaker`] holds.
pub struct DispatchCoordinator {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    pool: WorkerPool<DispatchJob, QueryResponse>,
    handler: Arc<QueryHandler>,
    admission: AdmissionMode,
    counters: DispatchCounters,
    started_at: Instant,
}

impl DispatchCoordinator {
    /// Start the worker pool. Must be called inside a Tokio runtime.
    pub fn new(
        cfg: &DispatchConfig,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        deps: Arc<ProcessorDeps>,
    ) -> Result<Self> {
        cfg.validate()?;
        let handler = Arc::new(QueryHandler::new(deps));
        let processors = ObjectPool::new(cfg.workers.workers, QueryProcessor::new);
        let pool = WorkerPool::start(cfg.workers.clone(), Arc::clone(&handler), processors)?;
        Ok(Self {
            breaker,
            limiter,
            pool,
            handler,
            admission: cfg.admission,
            counters: DispatchCounters::default(),
            started_at: Instant::now(),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &WorkerPool<DispatchJob, QueryResponse> {
        &self.pool
    }

    pub async fn dispatch(&self, ctx: &RequestContext, request: QueryRequest) -> Result<QueryResponse> {
        let policy = self.pool.config().queue_full;
        self.dispatch_job(ctx, DispatchJob::new(request), policy).await
    }

    /// Like [`dispatch`](Self::dispatch), with processing stages reported to `progress`.
    pub async fn dispatch_with_progress(
        &self,
        ctx: &RequestContext,
        request: QueryRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<QueryResponse> {
        let policy = self.pool.config().queue_full;
        self.dispatch_job(ctx, DispatchJob::with_progress(request, progress), policy)
            .await
    }

    /// Dispatch every request through the same admission path and worker pool.
    ///
    /// Items wait for queue space rather than being rejected. The report keeps
    /// input order; if every item failed the whole call fails with
    /// [`Error::BatchFailed`].
    pub async fn dispatch_batch(
        &self,
        ctx: &RequestContext,
        requests: Vec<QueryRequest>,
    ) -> Result<BatchReport<QueryResponse>> {
        if requests.is_empty() {
            return Ok(BatchReport::empty());
        }
        let total = requests.len();
        let report = self.dispatch_batch_items(ctx, requests).await.into_result();
        match &report {
            Ok(r) => info!(
                total,
                succeeded = r.success_count(),
                duration_ms = r.execution_time.as_millis() as u64,
                "batch complete"
            ),
            Err(e) => warn!(total, error = %e, "batch failed"),
        }
        report
    }

    /// Like [`dispatch_batch`](Self::dispatch_batch) but never collapses: every
    /// item's own result is kept, even when all of them failed.
    pub async fn dispatch_batch_items(
        &self,
        ctx: &RequestContext,
        requests: Vec<QueryRequest>,
    ) -> BatchReport<QueryResponse> {
        let started = Instant::now();
        let calls = requests
            .into_iter()
            .map(|r| self.dispatch_job(ctx, DispatchJob::new(r), QueueFullPolicy::Block));
        let items = futures::future::join_all(calls).await;
        BatchReport::new(items, started.elapsed())
    }

    async fn dispatch_job(
        &self,
        ctx: &RequestContext,
        job: DispatchJob,
        queue_full: QueueFullPolicy,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let request_id = job.request.request_id.clone();
        DispatchCounters::bump(&self.counters.total);

        let result = self.run_admitted(ctx, job, queue_full).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut response) => {
                DispatchCounters::bump(&self.counters.succeeded);
                if response.metrics.cache_hit {
                    DispatchCounters::bump(&self.counters.cache_hits);
                }
                if response.is_degraded() {
                    DispatchCounters::bump(&self.counters.degraded);
                }
                response.metrics.total_time_ms = elapsed_ms;
                info!(
                    request_id = request_id.as_str(),
                    duration_ms = elapsed_ms,
                    queue_wait_ms = response.metrics.queue_wait_ms,
                    worker_id = response.metrics.worker_id.unwrap_or_default(),
                    provider = response.served_by.provider.as_str(),
                    cache_hit = response.metrics.cache_hit,
                    "request complete"
                );
                Ok(response)
            }
            Err(err) => {
                DispatchCounters::bump(&self.counters.failed);
                if err.is_admission() {
                    debug!(request_id = request_id.as_str(), code = err.code(), "request rejected");
                } else {
                    warn!(
                        request_id = request_id.as_str(),
                        duration_ms = elapsed_ms,
                        code = err.code(),
                        error = %err,
                        "request failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_admitted(
        &self,
        ctx: &RequestContext,
        job: DispatchJob,
        queue_full: QueueFullPolicy,
    ) -> Result<QueryResponse> {
        if !self.breaker.allow_request() {
            DispatchCounters::bump(&self.counters.rejected_circuit_open);
            return Err(Error::circuit_open("dispatch"));
        }
        self.admit(ctx).await?;

        let ticket = match queue_full {
            QueueFullPolicy::Block => self.pool.submit(ctx, job).await?,
            QueueFullPolicy::Reject => self.pool.try_submit(ctx, job)?,
        };
        let result = self.await_slot(ctx, ticket).await?;
        self.record_outcome(&result);
        result.outcome
    }

    async fn admit(&self, ctx: &RequestContext) -> Result<()> {
        let admitted = match self.admission {
            AdmissionMode::Wait => self.limiter.acquire(ctx).await,
            AdmissionMode::Reject => {
                if self.limiter.try_acquire() {
                    Ok(())
                } else {
                    Err(Error::rate_limited("dispatch"))
                }
            }
        };
        if admitted.is_err() {
            DispatchCounters::bump(&self.counters.rejected_rate_limited);
        }
        admitted
    }

    /// Wait for the job's slot. Cancellation returns at once; the deadline is
    /// enforced by the worker, with a short grace for it to publish the result.
    async fn await_slot(
        &self,
        ctx: &RequestContext,
        ticket: JobTicket<QueryResponse>,
    ) -> Result<JobResult<QueryResponse>> {
        let background = RequestContext::background();
        let waiter = ticket.wait(&background);
        match ctx.deadline() {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = ctx.token().cancelled() => Err(Error::cancelled("dispatch")),
                    res = tokio::time::timeout_at(deadline + SLOT_GRACE, waiter) => {
                        res.unwrap_or_else(|_| Err(Error::deadline_exceeded("dispatch")))
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = ctx.token().cancelled() => Err(Error::cancelled("dispatch")),
                    res = waiter => res,
                }
            }
        }
    }

    fn record_outcome(&self, result: &JobResult<QueryResponse>) {
        match &result.outcome {
            // A cache hit never reached a provider.
            Ok(resp) if resp.metrics.cache_hit => {}
            Ok(_) => self.breaker.record_success(),
            Err(e) if result.executed && e.trips_breaker() => self.breaker.record_failure(),
            Err(_) => {}
        }
    }

    pub fn metrics(&self) -> DispatchMetrics {
        let pool = self.pool.stats();
        let breaker = self.breaker.snapshot();
        let limiter = self.limiter.snapshot();
        let c = &self.counters;
        DispatchMetrics {
            queue_depth: pool.queue_depth,
            queue_capacity: pool.queue_capacity,
            worker_count: pool.workers,
            active_workers: pool.active,
            peak_active_workers: pool.peak_active,
            circuit_state: breaker.state,
            available_tokens: (!limiter.unlimited).then_some(limiter.available),
            total_requests: DispatchCounters::read(&c.total),
            succeeded: DispatchCounters::read(&c.succeeded),
            failed: DispatchCounters::read(&c.failed),
            rejected_circuit_open: DispatchCounters::read(&c.rejected_circuit_open),
            rejected_rate_limited: DispatchCounters::read(&c.rejected_rate_limited),
            cache_hits: DispatchCounters::read(&c.cache_hits),
            degraded_responses: DispatchCounters::read(&c.degraded),
            processed_jobs: pool.processed,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            circuit_breaker: breaker,
            rate_limiter: limiter,
            cache: self.handler.deps().cache.stats(),
        }
    }

    pub async fn shutdown(&self, deadline: Instant, mode: ShutdownMode) -> Result<()> {
        self.pool.shutdown(deadline, mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::collaborators::Collaborators;
    use crate::pool::worker_pool::WorkerPoolConfig;
    use crate::providers::{
        ErrorClass, FallbackRouter, ProviderSlot, ProviderTier, RouterConfig, SimulatedProvider,
    };
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::resilience::rate_limiter::RateLimiterConfig;

    fn coordinator(
        provider: SimulatedProvider,
        max_failures: u32,
        limiter: RateLimiter,
        admission: AdmissionMode,
    ) -> DispatchCoordinator {
        let mut cfg = DispatchConfig::default();
        cfg.workers = WorkerPoolConfig::new().with_workers(2).with_queue_capacity(16);
        cfg.admission = admission;
        let deps = Arc::new(ProcessorDeps {
            router: FallbackRouter::new(
                vec![ProviderSlot::new(ProviderTier::Primary, Arc::new(provider))],
                RouterConfig::default(),
            )
            .unwrap(),
            collaborators: Collaborators::default(),
            cache: ResponseCache::disabled(),
        });
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_max_failures(max_failures)
                .with_reset_timeout(Duration::from_secs(30)),
        ));
        DispatchCoordinator::new(&cfg, breaker, Arc::new(limiter), deps).unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_dispatch_success_fills_metrics() {
        let c = coordinator(
            SimulatedProvider::new("p").with_default_sql("SELECT 42"),
            5,
            RateLimiter::unlimited(),
            AdmissionMode::Wait,
        );
        let resp = c.dispatch(&ctx(), QueryRequest::new("answer")).await.unwrap();
        assert_eq!(resp.sql, "SELECT 42");
        assert!(resp.metrics.worker_id.is_some());
        let m = c.metrics();
        assert_eq!((m.total_requests, m.succeeded), (1, 1));
        assert_eq!(m.worker_count, 2);
        assert_eq!(m.available_tokens, None);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_rejects_without_work() {
        let provider = Arc::new(SimulatedProvider::always_failing("p", ErrorClass::Unavailable));
        let mut cfg = DispatchConfig::default();
        cfg.workers = WorkerPoolConfig::new().with_workers(1).with_queue_capacity(4);
        let deps = Arc::new(ProcessorDeps {
            router: FallbackRouter::new(
                vec![ProviderSlot::new(ProviderTier::Primary, provider.clone())],
                RouterConfig::default(),
            )
            .unwrap(),
            collaborators: Collaborators::default(),
            cache: ResponseCache::disabled(),
        });
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new().with_max_failures(2)));
        let c = DispatchCoordinator::new(&cfg, breaker, Arc::new(RateLimiter::unlimited()), deps).unwrap();

        for _ in 0..2 {
            let err = c.dispatch(&ctx(), QueryRequest::new("q")).await.unwrap_err();
            assert!(matches!(err, Error::AllProvidersFailed { .. }));
        }
        assert_eq!(c.breaker().state(), CircuitState::Open);

        let err = c.dispatch(&ctx(), QueryRequest::new("q")).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(provider.calls(), 2);
        assert_eq!(c.metrics().rejected_circuit_open, 1);
    }

    #[tokio::test]
    async fn test_reject_mode_rate_limits() {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_capacity(1).without_refill());
        let c = coordinator(SimulatedProvider::new("p"), 5, limiter, AdmissionMode::Reject);
        assert!(c.dispatch(&ctx(), QueryRequest::new("a")).await.is_ok());
        let err = c.dispatch(&ctx(), QueryRequest::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        // Admission failures say nothing about downstream health.
        assert_eq!(c.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_trip_breaker() {
        let c = coordinator(SimulatedProvider::new("p"), 1, RateLimiter::unlimited(), AdmissionMode::Wait);
        let err = c.dispatch(&ctx(), QueryRequest::new("")).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(c.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_reports_partial_failure() {
        let c = coordinator(SimulatedProvider::new("p"), 10, RateLimiter::unlimited(), AdmissionMode::Wait);
        let report = c
            .dispatch_batch(
                &ctx(),
                vec![QueryRequest::new("a"), QueryRequest::new(""), QueryRequest::new("c")],
            )
            .await
            .unwrap();
        assert_eq!(report.len(), 3);
        assert!(report.items[0].is_ok());
        assert!(report.items[1].is_err());
        assert!(report.items[2].is_ok());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let c = coordinator(SimulatedProvider::new("p"), 5, RateLimiter::unlimited(), AdmissionMode::Wait);
        let report = c.dispatch_batch(&ctx(), vec![]).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_batch_all_failed() {
        let c = coordinator(SimulatedProvider::new("p"), 5, RateLimiter::unlimited(), AdmissionMode::Wait);
        let err = c
            .dispatch_batch(&ctx(), vec![QueryRequest::new(""), QueryRequest::new(" ")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchFailed { total: 2, .. }));
    }
}
