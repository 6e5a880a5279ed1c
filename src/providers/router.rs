use super::{ErrorClass, ProviderRequest, ProviderResponse, ProviderSlot, ProviderTier, ServedBy};
use crate::context::RequestContext;
use crate::error::ProviderAttempt;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Upper bound for a single tier's call, on top of the request deadline.
    /// A tier that hits it is classified as a timeout and the walk moves on.
    #[serde(with = "crate::config::opt_duration_ms")]
    pub attempt_timeout: Option<Duration>,
}

impl RouterConfig {
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// A successful walk: the response, who served it, and the tiers that failed first.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: ProviderResponse,
    pub served_by: ServedBy,
    pub failed_attempts: Vec<ProviderAttempt>,
    pub latency: Duration,
}

/// Walks the configured tiers in order (primary, fallback, local).
///
/// Retryable failures move to the next tier. Fatal failures (quota,
/// credentials, invalid request, unclassifiable) are returned immediately.
/// Each tier is tried at most once per call.
#[derive(Debug, Clone)]
pub struct FallbackRouter {
    slots: Vec<ProviderSlot>,
    cfg: RouterConfig,
}

impl FallbackRouter {
    pub fn new(mut slots: Vec<ProviderSlot>, cfg: RouterConfig) -> Result<Self> {
        if slots.is_empty() {
            return Err(Error::configuration_with_context(
                "at least one provider is required",
                ErrorContext::new()
                    .with_field_path("providers")
                    .with_source("fallback_router"),
            ));
        }
        slots.sort_by_key(|s| s.tier);
        if let Some(dup) = slots.windows(2).find(|w| w[0].tier == w[1].tier) {
            return Err(Error::configuration_with_context(
                format!("more than one provider configured for tier '{}'", dup[0].tier),
                ErrorContext::new()
                    .with_field_path("providers")
                    .with_details(format!("{} and {}", dup[0].name(), dup[1].name()))
                    .with_source("fallback_router"),
            ));
        }
        Ok(Self { slots, cfg })
    }

    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    pub async fn invoke(&self, ctx: &RequestContext, request: &ProviderRequest) -> Result<RoutedResponse> {
        let started = Instant::now();
        let mut failed: Vec<ProviderAttempt> = Vec::new();

        for slot in &self.slots {
            ctx.check("fallback_router")?;

            let attempt_ctx = match self.cfg.attempt_timeout {
                Some(t) => ctx.child_with_timeout(t),
                None => ctx.child(),
            };
            let outcome = attempt_ctx
                .run("fallback_router", slot.provider.invoke(&attempt_ctx, request))
                .await
                .and_then(|r| r);

            match outcome {
                Ok(response) => {
                    let degraded_reason = (slot.tier != ProviderTier::Primary).then(|| {
                        failed
                            .first()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "no primary provider configured".to_string())
                    });
                    if let Some(reason) = degraded_reason.as_deref() {
                        warn!(
                            request_id = request.request_id.as_str(),
                            provider = slot.name(),
                            tier = slot.tier.as_str(),
                            reason,
                            "served by degraded provider tier"
                        );
                    }
                    return Ok(RoutedResponse {
                        response,
                        served_by: ServedBy {
                            provider: slot.name().to_string(),
                            tier: slot.tier,
                            degraded_reason,
                        },
                        failed_attempts: failed,
                        latency: started.elapsed(),
                    });
                }
                Err(err) => {
                    // The request itself ended: that is not the provider's fault.
                    ctx.check("fallback_router")?;

                    let class = classify(&err);
                    failed.push(ProviderAttempt {
                        provider: slot.name().to_string(),
                        tier: slot.tier,
                        class,
                        message: provider_message(&err),
                    });
                    if !class.is_fallbackable() {
                        debug!(
                            provider = slot.name(),
                            class = class.as_str(),
                            "fatal provider failure, not falling back"
                        );
                        return Err(err);
                    }
                    warn!(
                        request_id = request.request_id.as_str(),
                        provider = slot.name(),
                        tier = slot.tier.as_str(),
                        class = class.as_str(),
                        "provider failed, trying next tier"
                    );
                }
            }
        }

        Err(Error::AllProvidersFailed { attempts: failed })
    }
}

fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::Provider { class, .. } => *class,
        // Only the per-attempt deadline can fire here; the request deadline is checked first.
        Error::DeadlineExceeded { .. } => ErrorClass::Timeout,
        Error::Validation { .. } => ErrorClass::InvalidRequest,
        Error::Runtime { message, .. } => ErrorClass::from_message(message),
        other => ErrorClass::from_message(&other.to_string()),
    }
}

fn provider_message(err: &Error) -> String {
    match err {
        Error::Provider { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
