//! Bounded worker pool.

use super::object_pool::{ObjectPool, Reusable};
use crate::context::RequestContext;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do when the job queue has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Wait for a slot, bounded by the submitter's context.
    Block,
    /// Fail immediately with [`Error::QueueFull`].
    Reject,
}

/// How queued work is treated on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Finish everything already queued.
    Drain,
    /// Cancel in-flight jobs and drop the queue; submitters see [`Error::ShuttingDown`].
    Abandon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_full: QueueFullPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let workers = cores * 2;
        Self {
            workers,
            queue_capacity: workers * 4,
            queue_full: QueueFullPolicy::Block,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn with_queue_full(mut self, policy: QueueFullPolicy) -> Self {
        self.queue_full = policy;
        self
    }
}

/// Everything a handler gets to see about the job it runs.
#[derive(Debug)]
pub struct JobInput<Req> {
    pub id: String,
    pub payload: Req,
    pub worker_id: usize,
    pub queue_wait: Duration,
    pub ctx: RequestContext,
}

/// The work a pool executes, with a recycled processor borrowed for the duration of one job.
#[async_trait]
pub trait JobHandler<Req, Resp, P>: Send + Sync + 'static
where
    P: Reusable,
{
    async fn handle(&self, processor: &mut P, job: JobInput<Req>) -> Result<Resp>;
}

/// One unit of submitted work. Owned by the queue until a worker claims it.
pub struct Job<Req, Resp> {
    pub id: String,
    pub payload: Req,
    pub submitted_at: Instant,
    pub ctx: RequestContext,
    slot: oneshot::Sender<JobResult<Resp>>,
}

/// Outcome of one job, written exactly once into its private slot.
#[derive(Debug)]
pub struct JobResult<Resp> {
    pub job_id: String,
    pub outcome: Result<Resp>,
    pub queue_wait: Duration,
    pub run_time: Duration,
    pub worker_id: Option<usize>,
    /// Whether the handler ran. False when the job expired in the queue.
    pub executed: bool,
}

/// Handle to a submitted job's result slot.
pub struct JobTicket<Resp> {
    job_id: String,
    rx: oneshot::Receiver<JobResult<Resp>>,
}

impl<Resp> JobTicket<Resp> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the result, giving up when `ctx` ends.
    pub async fn wait(self, ctx: &RequestContext) -> Result<JobResult<Resp>> {
        ctx.run("job_result", self.rx)
            .await?
            .map_err(|_| Error::ShuttingDown)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub active: usize,
    pub peak_active: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub processed: u64,
    pub failed: u64,
    pub accepting: bool,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
}

struct ActiveGuard<'a>(&'a Counters);

impl<'a> ActiveGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_active.fetch_max(now, Ordering::AcqRel);
        Self(counters)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed set of long-lived workers draining a bounded job queue.
///
/// At most `workers` jobs execute at any instant: each worker runs one job at
/// a time, and no other task executes handlers.
pub struct WorkerPool<Req, Resp> {
    cfg: WorkerPoolConfig,
    sender: std::sync::RwLock<Option<mpsc::Sender<Job<Req, Resp>>>>,
    accepting: AtomicBool,
    stop: CancellationToken,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl<Req, Resp> WorkerPool<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Spawn exactly `cfg.workers` workers on the current Tokio runtime.
    pub fn start<P, H>(cfg: WorkerPoolConfig, handler: Arc<H>, objects: ObjectPool<P>) -> Result<Self>
    where
        P: Reusable,
        H: JobHandler<Req, Resp, P> + ?Sized,
    {
        if cfg.workers == 0 || cfg.queue_capacity == 0 {
            return Err(Error::configuration_with_context(
                "worker count and queue capacity must be at least 1",
                ErrorContext::new()
                    .with_field_path("workers")
                    .with_source("worker_pool"),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::configuration_with_context(
                "worker pool must be started inside a Tokio runtime",
                ErrorContext::new().with_source("worker_pool"),
            )
        })?;

        let (tx, rx) = mpsc::channel::<Job<Req, Resp>>(cfg.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let stop = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let handles = (0..cfg.workers)
            .map(|worker_id| {
                runtime.spawn(worker_loop(
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&handler),
                    objects.clone(),
                    stop.clone(),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(
            workers = cfg.workers,
            queue_capacity = cfg.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            cfg,
            sender: std::sync::RwLock::new(Some(tx)),
            accepting: AtomicBool::new(true),
            stop,
            handles: std::sync::Mutex::new(handles),
            counters,
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.cfg
    }

    fn sender(&self) -> Result<mpsc::Sender<Job<Req, Resp>>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.sender
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(Error::ShuttingDown)
    }

    fn new_job(ctx: &RequestContext, payload: Req) -> (Job<Req, Resp>, JobTicket<Resp>) {
        let id = Uuid::new_v4().to_string();
        let (slot, rx) = oneshot::channel();
        let job = Job {
            id: id.clone(),
            payload,
            submitted_at: Instant::now(),
            ctx: ctx.clone(),
            slot,
        };
        (job, JobTicket { job_id: id, rx })
    }

    /// Submit, waiting for queue space until `ctx` ends.
    pub async fn submit(&self, ctx: &RequestContext, payload: Req) -> Result<JobTicket<Resp>> {
        let sender = self.sender()?;
        let (job, ticket) = Self::new_job(ctx, payload);
        ctx.run("worker_pool_submit", sender.send(job))
            .await?
            .map_err(|_| Error::ShuttingDown)?;
        Ok(ticket)
    }

    /// Submit without waiting; a full queue is rejected immediately.
    pub fn try_submit(&self, ctx: &RequestContext, payload: Req) -> Result<JobTicket<Resp>> {
        ctx.check("worker_pool_submit")?;
        let sender = self.sender()?;
        let (job, ticket) = Self::new_job(ctx, payload);
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull {
                capacity: self.cfg.queue_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => Error::ShuttingDown,
        })?;
        Ok(ticket)
    }

    /// Submit following the configured [`QueueFullPolicy`].
    pub async fn enqueue(&self, ctx: &RequestContext, payload: Req) -> Result<JobTicket<Resp>> {
        match self.cfg.queue_full {
            QueueFullPolicy::Block => self.submit(ctx, payload).await,
            QueueFullPolicy::Reject => self.try_submit(ctx, payload),
        }
    }

    /// Submit and wait for the job's result.
    pub async fn execute(&self, ctx: &RequestContext, payload: Req) -> Result<JobResult<Resp>> {
        self.enqueue(ctx, payload).await?.wait(ctx).await
    }

    pub fn queue_depth(&self) -> usize {
        match self.sender.read().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(tx) => tx.max_capacity().saturating_sub(tx.capacity()),
            None => 0,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.cfg.workers,
            active: self.counters.active.load(Ordering::Acquire),
            peak_active: self.counters.peak_active.load(Ordering::Acquire),
            queue_depth: self.queue_depth(),
            queue_capacity: self.cfg.queue_capacity,
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            accepting: self.is_accepting(),
        }
    }

    /// Stop accepting work and wait for the workers until `deadline`.
    ///
    /// Returns [`Error::ShutdownTimeout`] if the workers are still running when
    /// the deadline fires (an already-expired deadline fails immediately); the
    /// remaining workers are then cancelled rather than waited on.
    pub async fn shutdown(&self, deadline: Instant, mode: ShutdownMode) -> Result<()> {
        self.accepting.store(false, Ordering::Release);
        // Dropping our sender closes the queue once in-progress submitters finish.
        self.sender.write().unwrap_or_else(|p| p.into_inner()).take();
        if mode == ShutdownMode::Abandon {
            self.stop.cancel();
        }

        let mut handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        if handles.is_empty() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            let pending_workers = handles.iter().filter(|h| !h.is_finished()).count();
            if pending_workers > 0 {
                self.stop.cancel();
                warn!(pending_workers, "worker pool shutdown deadline already expired");
                return Err(Error::ShutdownTimeout { pending_workers });
            }
            return Ok(());
        }

        let joined = tokio::time::timeout_at(
            deadline,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;
        match joined {
            Ok(_) => {
                info!(mode = ?mode, "worker pool stopped");
                Ok(())
            }
            Err(_) => {
                self.stop.cancel();
                let pending_workers = handles.iter().filter(|h| !h.is_finished()).count();
                warn!(pending_workers, "worker pool shutdown deadline exceeded");
                Err(Error::ShutdownTimeout { pending_workers })
            }
        }
    }
}

impl<Req, Resp> Drop for WorkerPool<Req, Resp> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn worker_loop<Req, Resp, P, H>(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job<Req, Resp>>>>,
    handler: Arc<H>,
    objects: ObjectPool<P>,
    stop: CancellationToken,
    counters: Arc<Counters>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
    P: Reusable,
    H: JobHandler<Req, Resp, P> + ?Sized,
{
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = next else {
            break;
        };
        run_job(worker_id, job, handler.as_ref(), &objects, &stop, &counters).await;
    }
    debug!(worker_id, "worker exited");
}

async fn run_job<Req, Resp, P, H>(
    worker_id: usize,
    job: Job<Req, Resp>,
    handler: &H,
    objects: &ObjectPool<P>,
    stop: &CancellationToken,
    counters: &Counters,
) where
    P: Reusable,
    H: JobHandler<Req, Resp, P> + ?Sized,
{
    let Job {
        id,
        payload,
        submitted_at,
        ctx,
        slot,
    } = job;
    let queue_wait = submitted_at.elapsed();

    if slot.is_closed() {
        debug!(job_id = id.as_str(), "submitter gone, skipping job");
        return;
    }

    let started = Instant::now();
    let mut executed = false;
    let outcome = match ctx.check("worker_pool") {
        Err(e) => Err(e),
        Ok(()) => match objects.get() {
            Err(e) => Err(e),
            Ok(mut processor) => {
                executed = true;
                let _active = ActiveGuard::enter(counters);
                let input = JobInput {
                    id: id.clone(),
                    payload,
                    worker_id,
                    queue_wait,
                    ctx: ctx.clone(),
                };
                let work = AssertUnwindSafe(handler.handle(&mut *processor, input)).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    _ = stop.cancelled() => Err(Error::ShuttingDown),
                    res = ctx.run("worker_pool", work) => match res {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(_panic)) => Err(Error::runtime_with_context(
                            "job handler panicked",
                            ErrorContext::new()
                                .with_source("worker_pool")
                                .with_details(format!("job_id: {}", id)),
                        )),
                        Err(e) => Err(e),
                    },
                };
                // `processor` drops here: reset and returned to the pool.
                outcome
            }
        },
    };

    counters.processed.fetch_add(1, Ordering::Relaxed);
    if outcome.is_err() {
        counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    let _ = slot.send(JobResult {
        job_id: id,
        outcome,
        queue_wait,
        run_time: started.elapsed(),
        worker_id: Some(worker_id),
        executed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        seen: Vec<u32>,
    }

    impl Reusable for Scratch {
        fn reset(&mut self) {
            self.seen.clear();
        }
    }

    struct Echo {
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl Echo {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler<u32, (u32, usize), Scratch> for Echo {
        async fn handle(&self, scratch: &mut Scratch, job: JobInput<u32>) -> Result<(u32, usize)> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let stale = scratch.seen.len();
            scratch.seen.push(job.payload);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if job.payload == 13 {
                return Err(Error::runtime_with_context("unlucky", ErrorContext::new()));
            }
            Ok((job.payload * 2, stale))
        }
    }

    fn pool(workers: usize, queue: usize, handler: Arc<Echo>) -> WorkerPool<u32, (u32, usize)> {
        WorkerPool::start(
            WorkerPoolConfig::new()
                .with_workers(workers)
                .with_queue_capacity(queue),
            handler,
            ObjectPool::new(workers, Scratch::default),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_returns_result_in_private_slot() {
        let pool = pool(2, 8, Echo::new(Duration::from_millis(1)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let res = pool.execute(&ctx, 21).await.unwrap();
        assert_eq!(res.outcome.unwrap().0, 42);
        assert!(res.worker_id.is_some());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_worker_count() {
        for workers in [1usize, 3, 5] {
            let handler = Echo::new(Duration::from_millis(10));
            let pool = Arc::new(pool(workers, 64, Arc::clone(&handler)));
            let ctx = RequestContext::with_timeout(Duration::from_secs(10));
            let calls = (0..20u32).map(|i| {
                let pool = Arc::clone(&pool);
                let ctx = ctx.clone();
                async move { pool.execute(&ctx, i).await }
            });
            let results = futures::future::join_all(calls).await;
            assert!(results.iter().all(|r| r.is_ok()));
            assert!(handler.max_running.load(Ordering::SeqCst) <= workers);
            assert!(pool.stats().peak_active <= workers);
        }
    }

    #[tokio::test]
    async fn test_processor_state_never_leaks_between_jobs() {
        let pool = pool(1, 16, Echo::new(Duration::from_millis(1)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        for i in 0..5 {
            let res = pool.execute(&ctx, i).await.unwrap();
            assert_eq!(res.outcome.unwrap().1, 0, "processor carried state into job {}", i);
        }
    }

    #[tokio::test]
    async fn test_try_submit_rejects_when_queue_full() {
        let pool = pool(1, 1, Echo::new(Duration::from_millis(200)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let first = pool.try_submit(&ctx, 1).unwrap();
        // Give the single worker time to claim the first job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _second = pool.try_submit(&ctx, 2).unwrap();
        let third = pool.try_submit(&ctx, 3);
        assert!(matches!(third, Err(Error::QueueFull { capacity: 1 })));
        assert!(first.wait(&ctx).await.unwrap().outcome.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_submit_gives_up_at_deadline() {
        let pool = pool(1, 1, Echo::new(Duration::from_millis(300)));
        let long = RequestContext::with_timeout(Duration::from_secs(5));
        let _a = pool.submit(&long, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _b = pool.submit(&long, 2).await.unwrap();

        let short = RequestContext::with_timeout(Duration::from_millis(30));
        let err = pool.submit(&short, 3).await.err().unwrap();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn test_handler_error_is_delivered() {
        let pool = pool(1, 4, Echo::new(Duration::from_millis(1)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let res = pool.execute(&ctx, 13).await.unwrap();
        assert!(res.outcome.is_err());
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_drain_shutdown_finishes_queue() {
        let pool = pool(1, 8, Echo::new(Duration::from_millis(5)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let tickets: Vec<_> = (0..4).map(|i| pool.try_submit(&ctx, i).unwrap()).collect();

        pool.shutdown(Instant::now() + Duration::from_secs(5), ShutdownMode::Drain)
            .await
            .unwrap();
        for t in tickets {
            assert!(t.wait(&ctx).await.unwrap().outcome.is_ok());
        }
        assert!(matches!(pool.try_submit(&ctx, 9), Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_shutdown_with_expired_deadline_does_not_hang() {
        let pool = pool(2, 4, Echo::new(Duration::from_millis(1)));
        let expired = Instant::now() - Duration::from_millis(1);
        let res = tokio::time::timeout(
            Duration::from_secs(1),
            pool.shutdown(expired, ShutdownMode::Drain),
        )
        .await
        .expect("shutdown hung");
        assert!(matches!(res, Err(Error::ShutdownTimeout { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_deadline_exceeded_by_slow_job() {
        let pool = pool(1, 4, Echo::new(Duration::from_secs(10)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(30));
        let ticket = pool.try_submit(&ctx, 1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let res = pool
            .shutdown(Instant::now() + Duration::from_millis(50), ShutdownMode::Drain)
            .await;
        assert!(matches!(res, Err(Error::ShutdownTimeout { pending_workers: 1 })));
        // The abandoned job still resolves its slot.
        let outcome = ticket.wait(&ctx).await.unwrap().outcome;
        assert!(matches!(outcome, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_abandon_shutdown_fails_queued_jobs() {
        let pool = pool(1, 8, Echo::new(Duration::from_millis(200)));
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let tickets: Vec<_> = (0..3).map(|i| pool.try_submit(&ctx, i).unwrap()).collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown(Instant::now() + Duration::from_secs(2), ShutdownMode::Abandon)
            .await
            .unwrap();
        for t in tickets {
            match t.wait(&ctx).await {
                Err(Error::ShuttingDown) => {}
                Ok(r) => assert!(matches!(r.outcome, Err(Error::ShuttingDown))),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_rejects_zero_workers() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let res: Result<WorkerPool<u32, (u32, usize)>> = WorkerPool::start(
                WorkerPoolConfig::new().with_workers(0),
                Echo::new(Duration::ZERO),
                ObjectPool::new(1, Scratch::default),
            );
            assert!(matches!(res, Err(Error::Configuration { .. })));
        });
    }
}
