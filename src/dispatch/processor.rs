//! Per-request processing pipeline executed on a worker.

use crate::cache::{CacheKey, ResponseCache};
use crate::collaborators::{Collaborators, Intent, PromptInput, SchemaContext};
use crate::context::RequestContext;
use crate::pool::object_pool::Reusable;
use crate::pool::worker_pool::{JobHandler, JobInput};
use crate::providers::{FallbackRouter, ProviderRequest};
use crate::streaming::session::{NoopProgress, ProgressReporter};
use crate::types::{ProcessingMetrics, QueryRequest, QueryResponse};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Work item handed to the worker pool.
pub struct DispatchJob {
    pub request: QueryRequest,
    pub progress: Arc<dyn ProgressReporter>,
}

impl DispatchJob {
    pub fn new(request: QueryRequest) -> Self {
        Self {
            request,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(request: QueryRequest, progress: Arc<dyn ProgressReporter>) -> Self {
        Self { request, progress }
    }
}

impl std::fmt::Debug for DispatchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchJob")
            .field("request_id", &self.request.request_id)
            .finish()
    }
}

/// Scratch state for one request. Recycled through the object pool.
///
/// Everything in here is request-specific; `reset` must leave no trace of the
/// previous request (prompt text, schema, intent, provider notes).
#[derive(Debug, Default)]
pub struct QueryProcessor {
    prompt: String,
    intent: Option<Intent>,
    context: Option<SchemaContext>,
    notes: Vec<String>,
    uses: u64,
}

impl Reusable for QueryProcessor {
    fn reset(&mut self) {
        self.prompt.clear();
        self.intent = None;
        self.context = None;
        self.notes.clear();
    }
}

impl QueryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many requests this instance has served.
    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub fn is_clean(&self) -> bool {
        self.prompt.is_empty() && self.intent.is_none() && self.context.is_none() && self.notes.is_empty()
    }

    pub async fn process(
        &mut self,
        deps: &ProcessorDeps,
        ctx: &RequestContext,
        request: &QueryRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<QueryResponse> {
        self.uses += 1;
        if request.query.trim().is_empty() {
            return Err(Error::validation_with_context(
                "query must not be empty",
                ErrorContext::new()
                    .with_field_path("request.query")
                    .with_source("query_processor"),
            ));
        }
        let mut metrics = ProcessingMetrics::default();

        let schema = deps.collaborators.context.build_context(request).await?;
        self.context = Some(schema);
        progress.report_progress("context", 10.0).await?;

        self.intent = deps
            .collaborators
            .intent
            .classify_intent(&request.query)
            .await?;
        progress.report_progress("intent", 25.0).await?;

        let key = CacheKey::for_query(
            request.connection_id.as_deref(),
            &request.query,
            self.intent.as_ref().map(|i| i.label.as_str()),
        );
        if request.options.use_cache {
            if let Some(mut cached) = deps.cache.get(&key) {
                debug!(request_id = request.request_id.as_str(), "cache hit");
                cached.request_id = request.request_id.clone();
                cached.metrics = ProcessingMetrics {
                    cache_hit: true,
                    ..ProcessingMetrics::default()
                };
                progress.report_progress("cache", 90.0).await?;
                return Ok(cached);
            }
        }

        let schema = self.context.as_ref().cloned().unwrap_or_default();
        self.prompt = deps.collaborators.prompt.render_prompt(&PromptInput {
            query: &request.query,
            intent: self.intent.as_ref(),
            context: &schema,
        })?;
        progress.report_progress("prompt", 40.0).await?;

        ctx.check("query_processor")?;
        let downstream_started = Instant::now();
        let routed = deps
            .router
            .invoke(
                ctx,
                &ProviderRequest {
                    request_id: request.request_id.clone(),
                    prompt: self.prompt.clone(),
                    model: request.options.model.clone(),
                    max_tokens: request.options.max_tokens,
                },
            )
            .await?;
        metrics.downstream_ms = downstream_started.elapsed().as_millis() as u64;
        metrics.tokens_used = routed.response.tokens_used;
        self.notes
            .extend(routed.failed_attempts.iter().map(|a| a.to_string()));
        progress.report_progress("generation", 75.0).await?;

        let validation_started = Instant::now();
        let report = deps
            .collaborators
            .validator
            .validate(&routed.response.sql, request)
            .await?;
        metrics.validation_ms = validation_started.elapsed().as_millis() as u64;
        if !report.valid {
            warn!(
                request_id = request.request_id.as_str(),
                issues = report.issues.len(),
                "generated SQL rejected by validator"
            );
            return Err(Error::validation_with_context(
                "generated SQL failed validation",
                ErrorContext::new()
                    .with_details(report.issues.join("; "))
                    .with_source("sql_validator"),
            ));
        }
        progress.report_progress("validation", 90.0).await?;

        let response = QueryResponse {
            request_id: request.request_id.clone(),
            sql: report.sanitized_sql.unwrap_or(routed.response.sql),
            explanation: routed
                .response
                .explanation
                .filter(|_| request.options.include_explanation),
            intent: self.intent.as_ref().map(|i| i.label.clone()),
            confidence: routed.response.confidence,
            warnings: self.notes.clone(),
            served_by: routed.served_by,
            metrics,
        };

        // Degraded answers are not cached, so the next request retries the primary.
        if !response.is_degraded() {
            deps.cache.insert(&key, response.clone());
        }
        Ok(response)
    }
}

/// Shared, read-only dependencies of every processor.
pub struct ProcessorDeps {
    pub router: FallbackRouter,
    pub collaborators: Collaborators,
    pub cache: ResponseCache<QueryResponse>,
}

/// Worker-pool handler: runs a [`QueryProcessor`] for each [`DispatchJob`].
pub struct QueryHandler {
    deps: Arc<ProcessorDeps>,
}

impl QueryHandler {
    pub fn new(deps: Arc<ProcessorDeps>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &ProcessorDeps {
        &self.deps
    }
}

#[async_trait]
impl JobHandler<DispatchJob, QueryResponse, QueryProcessor> for QueryHandler {
    async fn handle(&self, processor: &mut QueryProcessor, job: JobInput<DispatchJob>) -> Result<QueryResponse> {
        let JobInput {
            payload,
            worker_id,
            queue_wait,
            ctx,
            ..
        } = job;
        let mut response = processor
            .process(&self.deps, &ctx, &payload.request, payload.progress.as_ref())
            .await?;
        response.metrics.worker_id = Some(worker_id);
        response.metrics.queue_wait_ms = queue_wait.as_millis() as u64;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{SqlValidator, ValidationReport};
    use crate::providers::{ProviderSlot, ProviderTier, RouterConfig, SimulatedProvider};
    use std::time::Duration;

    struct RejectDrops;

    #[async_trait]
    impl SqlValidator for RejectDrops {
        async fn validate(&self, sql: &str, _request: &QueryRequest) -> Result<ValidationReport> {
            if sql.to_uppercase().contains("DROP") {
                Ok(ValidationReport::rejected(vec!["DROP is not allowed".into()]))
            } else {
                Ok(ValidationReport::ok())
            }
        }
    }

    fn deps(sql: &str, collaborators: Collaborators) -> ProcessorDeps {
        let provider = Arc::new(SimulatedProvider::new("primary").with_default_sql(sql));
        ProcessorDeps {
            router: FallbackRouter::new(
                vec![ProviderSlot::new(ProviderTier::Primary, provider)],
                RouterConfig::default(),
            )
            .unwrap(),
            collaborators,
            cache: ResponseCache::new(16, Duration::from_secs(60)),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_process_populates_metrics_and_state() {
        let deps = deps("SELECT 1", Collaborators::default());
        let mut p = QueryProcessor::new();
        let resp = p
            .process(&deps, &ctx(), &QueryRequest::new("one"), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(resp.sql, "SELECT 1");
        assert_eq!(resp.metrics.tokens_used, 42);
        assert!(!resp.metrics.cache_hit);
        assert!(!p.is_clean());
        p.reset();
        assert!(p.is_clean());
    }

    #[tokio::test]
    async fn test_second_identical_query_hits_cache() {
        let deps = deps("SELECT 1", Collaborators::default());
        let mut p = QueryProcessor::new();
        p.process(&deps, &ctx(), &QueryRequest::new("count users"), &NoopProgress)
            .await
            .unwrap();
        p.reset();
        let again = p
            .process(&deps, &ctx(), &QueryRequest::new("Count  users"), &NoopProgress)
            .await
            .unwrap();
        assert!(again.metrics.cache_hit);
        assert_eq!(again.metrics.tokens_used, 0);

        let bypass = p
            .process(&deps, &ctx(), &QueryRequest::new("count users").without_cache(), &NoopProgress)
            .await
            .unwrap();
        assert!(!bypass.metrics.cache_hit);
    }

    #[tokio::test]
    async fn test_validator_rejection_is_validation_error() {
        let collaborators = Collaborators {
            validator: Arc::new(RejectDrops),
            ..Collaborators::default()
        };
        let deps = deps("DROP TABLE users", collaborators);
        let err = QueryProcessor::new()
            .process(&deps, &ctx(), &QueryRequest::new("remove users"), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.trips_breaker());
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let deps = deps("SELECT 1", Collaborators::default());
        let err = QueryProcessor::new()
            .process(&deps, &ctx(), &QueryRequest::new("   "), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
