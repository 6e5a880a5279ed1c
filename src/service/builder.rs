use super::QueryService;
use crate::cache::ResponseCache;
use crate::collaborators::{
    Collaborators, ContextBuilder, FeedbackRecorder, IntentClassifier, PromptRenderer, SqlValidator,
    UsageRecorder,
};
use crate::config::{AdmissionMode, DispatchConfig};
use crate::dispatch::{DispatchCoordinator, ProcessorDeps};
use crate::providers::{FallbackRouter, Provider, ProviderSlot, ProviderTier};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::rate_limiter::RateLimiter;
use crate::streaming::StreamPipeline;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builder for [`QueryService`].
///
/// Keep this surface small: providers and collaborators are wired here,
/// everything tunable lives in [`DispatchConfig`].
pub struct QueryServiceBuilder {
    config: DispatchConfig,
    providers: Vec<ProviderSlot>,
    collaborators: Collaborators,
    breaker: Option<Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl QueryServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            providers: Vec::new(),
            collaborators: Collaborators::default(),
            breaker: None,
            rate_limiter: None,
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Overlay `NL2SQL_*` environment variables on the current config.
    ///
    /// See [`DispatchConfig::with_env_overrides`] for the variables read.
    pub fn config_from_env(mut self) -> Self {
        self.config = self.config.with_env_overrides();
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers.workers = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.workers.queue_capacity = n;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn admission(mut self, mode: AdmissionMode) -> Self {
        self.config.admission = mode;
        self
    }

    /// Place a provider at `tier`. A later call for the same tier replaces the earlier one.
    pub fn provider(mut self, tier: ProviderTier, provider: Arc<dyn Provider>) -> Self {
        self.providers.retain(|slot| slot.tier != tier);
        self.providers.push(ProviderSlot::new(tier, provider));
        self
    }

    pub fn primary(self, provider: Arc<dyn Provider>) -> Self {
        self.provider(ProviderTier::Primary, provider)
    }

    pub fn fallback(self, provider: Arc<dyn Provider>) -> Self {
        self.provider(ProviderTier::Fallback, provider)
    }

    pub fn local(self, provider: Arc<dyn Provider>) -> Self {
        self.provider(ProviderTier::Local, provider)
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn intent_classifier(mut self, c: Arc<dyn IntentClassifier>) -> Self {
        self.collaborators.intent = c;
        self
    }

    pub fn context_builder(mut self, c: Arc<dyn ContextBuilder>) -> Self {
        self.collaborators.context = c;
        self
    }

    pub fn prompt_renderer(mut self, r: Arc<dyn PromptRenderer>) -> Self {
        self.collaborators.prompt = r;
        self
    }

    pub fn sql_validator(mut self, v: Arc<dyn SqlValidator>) -> Self {
        self.collaborators.validator = v;
        self
    }

    /// Inject a usage recorder. Default is a no-op.
    pub fn usage_recorder(mut self, r: Arc<dyn UsageRecorder>) -> Self {
        self.collaborators.usage = r;
        self
    }

    /// Inject a feedback recorder. Default is a no-op.
    pub fn feedback_recorder(mut self, r: Arc<dyn FeedbackRecorder>) -> Self {
        self.collaborators.feedback = r;
        self
    }

    /// Share an existing breaker instead of building one from the config.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Share an existing limiter instead of building one from the config.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Build the service. Must be called inside a Tokio runtime: the worker
    /// pool and the limiter refiller are spawned here.
    pub fn build(self) -> Result<QueryService> {
        let Self {
            config,
            providers,
            collaborators,
            breaker,
            rate_limiter,
        } = self;
        config.validate()?;

        let router = FallbackRouter::new(providers, config.router.clone())?;
        let breaker = breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::named("dispatch", config.breaker.clone())));
        let limiter = rate_limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(config.rate_limiter.clone())));

        let usage = Arc::clone(&collaborators.usage);
        let feedback = Arc::clone(&collaborators.feedback);
        let deps = Arc::new(ProcessorDeps {
            router,
            collaborators,
            cache: ResponseCache::from_config(&config.cache),
        });
        let coordinator = DispatchCoordinator::new(&config, breaker, limiter, deps)?;

        info!(
            workers = config.workers.workers,
            queue_capacity = config.workers.queue_capacity,
            rate = config.rate_limiter.rate,
            max_failures = config.breaker.max_failures,
            "query service started"
        );

        Ok(QueryService {
            pipeline: StreamPipeline::from_config(&config.streaming),
            coordinator,
            usage,
            feedback,
            config,
        })
    }
}

impl Default for QueryServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
