//! # Service Module
//!
//! The exposed surface: [`QueryService`] built by [`QueryServiceBuilder`].
//!
//! Every entry point (single, batch, streaming) goes through the same
//! [`DispatchCoordinator`], so admission control and the worker bound apply
//! uniformly. Usage and outcome feedback are recorded after each request;
//! recorder failures are logged and never change the caller's result.

mod builder;

pub use builder::QueryServiceBuilder;

use crate::batch::BatchReport;
use crate::collaborators::{timestamp, FeedbackEvent, FeedbackRecorder, UsageRecord, UsageRecorder};
use crate::config::DispatchConfig;
use crate::context::RequestContext;
use crate::dispatch::{DispatchCoordinator, DispatchMetrics};
use crate::pool::worker_pool::ShutdownMode;
use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::streaming::{EventSink, ProgressReporter, StreamPipeline, StreamSession};
use crate::types::{QueryRequest, QueryResponse};
use crate::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub struct QueryService {
    pub(crate) coordinator: DispatchCoordinator,
    pub(crate) pipeline: StreamPipeline,
    pub(crate) usage: Arc<dyn UsageRecorder>,
    pub(crate) feedback: Arc<dyn FeedbackRecorder>,
    pub(crate) config: DispatchConfig,
}

/// Identity of a request kept for recording after the request is consumed.
struct RequestMeta {
    request_id: String,
    user_id: Option<String>,
}

impl RequestMeta {
    fn of(request: &QueryRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            user_id: request.user_id.clone(),
        }
    }
}

impl QueryService {
    pub fn builder() -> QueryServiceBuilder {
        QueryServiceBuilder::new()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &DispatchCoordinator {
        &self.coordinator
    }

    fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.config.request_timeout)
    }

    /// Process one request under the configured request timeout.
    pub async fn process(&self, request: QueryRequest) -> Result<QueryResponse> {
        let ctx = self.request_context();
        self.process_with_context(&ctx, request).await
    }

    /// Process one request under a caller-supplied deadline and cancellation token.
    pub async fn process_with_context(
        &self,
        ctx: &RequestContext,
        request: QueryRequest,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let meta = RequestMeta::of(&request);
        let result = self.coordinator.dispatch(ctx, request).await;
        self.record(&meta, result.as_ref(), started.elapsed()).await;
        result
    }

    pub async fn process_batch(&self, requests: Vec<QueryRequest>) -> Result<BatchReport<QueryResponse>> {
        let ctx = self.request_context();
        let started = Instant::now();
        let metas: Vec<RequestMeta> = requests.iter().map(RequestMeta::of).collect();
        let report = self.coordinator.dispatch_batch_items(&ctx, requests).await;
        let elapsed = started.elapsed();
        // Each item is recorded with its own outcome before an all-failed batch collapses.
        for (meta, item) in metas.iter().zip(&report.items) {
            self.record(meta, item.as_ref(), elapsed).await;
        }
        match report.into_result() {
            Ok(report) => {
                info!(
                    total = report.len(),
                    succeeded = report.success_count(),
                    duration_ms = elapsed.as_millis() as u64,
                    "batch complete"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(total = metas.len(), error = %err, "batch failed");
                Err(err)
            }
        }
    }

    /// Process one request and deliver it to `sink` as a sequenced event stream:
    /// `start`, progress and heartbeats while the request runs, the SQL as
    /// `chunk` events, then `complete`, or a single `error` event on failure.
    ///
    /// `streaming.session_timeout`, when set, tightens the request timeout.
    pub async fn process_streaming(
        &self,
        request: QueryRequest,
        sink: Box<dyn EventSink>,
    ) -> Result<QueryResponse> {
        let ctx = match self.config.streaming.session_timeout {
            Some(limit) => self.request_context().child_with_timeout(limit),
            None => self.request_context(),
        };
        let started = Instant::now();
        let meta = RequestMeta::of(&request);
        let session = Arc::new(StreamSession::with_id(request.request_id.clone(), sink));
        let metadata = json!({
            "requestId": request.request_id,
            "connectionId": request.connection_id,
        });

        let progress: Arc<dyn ProgressReporter> = session.clone();
        let coordinator = &self.coordinator;
        let result = self
            .pipeline
            .run(Arc::clone(&session), &ctx, Some(metadata), move |work_ctx| async move {
                coordinator
                    .dispatch_with_progress(&work_ctx, request, progress)
                    .await
            })
            .await;

        self.record(&meta, result.as_ref(), started.elapsed()).await;
        result
    }

    /// Record user feedback (ratings, corrections) for a past request.
    pub async fn record_feedback(&self, event: FeedbackEvent) -> Result<()> {
        self.feedback.record_feedback(event).await
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.coordinator.metrics()
    }

    pub fn circuit_breaker_status(&self) -> CircuitBreakerSnapshot {
        self.coordinator.breaker().snapshot()
    }

    /// Stop accepting work and drain queued jobs until `deadline`.
    pub async fn shutdown(&self, deadline: Instant) -> Result<()> {
        self.shutdown_with(deadline, ShutdownMode::Drain).await
    }

    pub async fn shutdown_with(&self, deadline: Instant, mode: ShutdownMode) -> Result<()> {
        self.coordinator.shutdown(deadline, mode).await
    }

    async fn record(
        &self,
        meta: &RequestMeta,
        outcome: std::result::Result<&QueryResponse, &Error>,
        elapsed: Duration,
    ) {
        let now = timestamp();
        let (usage, event) = match outcome {
            Ok(resp) => (
                UsageRecord {
                    request_id: meta.request_id.clone(),
                    user_id: meta.user_id.clone(),
                    provider: Some(resp.served_by.provider.clone()),
                    tier: Some(resp.served_by.tier),
                    tokens_used: resp.metrics.tokens_used,
                    latency_ms: resp.metrics.total_time_ms,
                    cache_hit: resp.metrics.cache_hit,
                    success: true,
                    timestamp: now,
                },
                FeedbackEvent::Outcome {
                    request_id: meta.request_id.clone(),
                    success: true,
                    degraded: resp.is_degraded(),
                    error_code: None,
                    timestamp: now,
                },
            ),
            Err(err) => (
                UsageRecord {
                    request_id: meta.request_id.clone(),
                    user_id: meta.user_id.clone(),
                    provider: None,
                    tier: None,
                    tokens_used: 0,
                    latency_ms: elapsed.as_millis() as u64,
                    cache_hit: false,
                    success: false,
                    timestamp: now,
                },
                FeedbackEvent::Outcome {
                    request_id: meta.request_id.clone(),
                    success: false,
                    degraded: false,
                    error_code: Some(err.code().to_string()),
                    timestamp: now,
                },
            ),
        };

        if let Err(e) = self.usage.record_usage(usage).await {
            warn!(request_id = meta.request_id.as_str(), error = %e, "usage recording failed");
        }
        if let Err(e) = self.feedback.record_feedback(event).await {
            warn!(request_id = meta.request_id.as_str(), error = %e, "feedback recording failed");
        }
    }
}
