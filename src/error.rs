use crate::providers::classification::ErrorClass;
use crate::providers::ProviderTier;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "workers.count", "request.query")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected value, observed state)
    pub details: Option<String>,
    /// Source of the error (e.g., "circuit_breaker", "worker_pool")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One failed hop recorded by the fallback router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    pub provider: String,
    pub tier: ProviderTier,
    pub class: ErrorClass,
    pub message: String,
}

impl std::fmt::Display for ProviderAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {} [{}]",
            self.provider,
            self.tier.as_str(),
            self.message,
            self.class.as_str()
        )
    }
}

/// Unified error type for the dispatch runtime.
///
/// Variants are grouped the way callers react to them: admission, provider,
/// resource and protocol failures, plus configuration and validation.
#[derive(Debug, Error)]
pub enum Error {
    // -- admission --
    #[error("Rate limited: no admission permit available{}", format_context(.context))]
    RateLimited { context: ErrorContext },

    #[error("Circuit breaker open{}", format_context(.context))]
    CircuitOpen { context: ErrorContext },

    // -- provider --
    #[error("Provider error: {provider} ({}): {message}", .class.as_str())]
    Provider {
        provider: String,
        class: ErrorClass,
        message: String,
    },

    #[error("All providers failed: {}", format_attempts(.attempts))]
    AllProvidersFailed { attempts: Vec<ProviderAttempt> },

    // -- resource --
    #[error("Job queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Object pool exhausted ({outstanding} instances checked out)")]
    PoolExhausted { outstanding: usize },

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Shutdown deadline exceeded with {pending_workers} worker(s) still running")]
    ShutdownTimeout { pending_workers: usize },

    // -- protocol --
    #[error("Stream sink error: {message}{}", format_context(.context))]
    Sink {
        message: String,
        context: ErrorContext,
    },

    #[error("Operation cancelled{}", format_context(.context))]
    Cancelled { context: ErrorContext },

    #[error("Deadline exceeded{}", format_context(.context))]
    DeadlineExceeded { context: ErrorContext },

    // -- batch --
    /// `codes` holds each item's own error code, in input order.
    #[error("Batch failed: all {total} request(s) failed; first error: {first}")]
    BatchFailed {
        total: usize,
        first: String,
        codes: Vec<String>,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn sink_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Sink {
            message: msg.into(),
            context,
        }
    }

    pub fn provider(provider: impl Into<String>, class: ErrorClass, msg: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            class,
            message: msg.into(),
        }
    }

    pub fn rate_limited(source: &str) -> Self {
        Error::RateLimited {
            context: ErrorContext::new().with_source(source),
        }
    }

    pub fn circuit_open(source: &str) -> Self {
        Error::CircuitOpen {
            context: ErrorContext::new().with_source(source),
        }
    }

    pub fn cancelled(source: &str) -> Self {
        Error::Cancelled {
            context: ErrorContext::new().with_source(source),
        }
    }

    pub fn deadline_exceeded(source: &str) -> Self {
        Error::DeadlineExceeded {
            context: ErrorContext::new().with_source(source),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::RateLimited { context }
            | Error::CircuitOpen { context }
            | Error::Cancelled { context }
            | Error::DeadlineExceeded { context }
            | Error::Sink { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Admission errors are returned before any downstream work starts.
    pub fn is_admission(&self) -> bool {
        matches!(self, Error::RateLimited { .. } | Error::CircuitOpen { .. })
    }

    /// Whether switching to another provider can help.
    pub fn is_fallbackable(&self) -> bool {
        match self {
            Error::Provider { class, .. } => class.is_fallbackable(),
            _ => false,
        }
    }

    /// Whether the same operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { class, .. } => class.is_fallbackable(),
            Error::AllProvidersFailed { attempts } => {
                attempts.iter().any(|a| a.class.is_fallbackable())
            }
            Error::RateLimited { .. }
            | Error::CircuitOpen { .. }
            | Error::QueueFull { .. }
            | Error::PoolExhausted { .. }
            | Error::DeadlineExceeded { .. } => true,
            _ => false,
        }
    }

    /// Whether this outcome counts as a downstream failure for the circuit breaker.
    ///
    /// Caller-side problems (validation, cancellation, admission, local resource
    /// exhaustion) say nothing about downstream health and are excluded.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Error::Provider { .. } | Error::AllProvidersFailed { .. } | Error::DeadlineExceeded { .. }
        )
    }

    /// Stable machine-readable code, used in stream error events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::Provider { .. } => "PROVIDER_ERROR",
            Error::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
            Error::QueueFull { .. } => "QUEUE_FULL",
            Error::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            Error::Sink { .. } => "SINK_ERROR",
            Error::Cancelled { .. } => "CANCELLED",
            Error::DeadlineExceeded { .. } => "TIMEOUT",
            Error::BatchFailed { .. } => "BATCH_FAILED",
            Error::Configuration { .. } => "CONFIGURATION_ERROR",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Runtime { .. } => "RUNTIME_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_rendered_in_display() {
        let err = Error::validation_with_context(
            "query must not be empty",
            ErrorContext::new()
                .with_field_path("request.query")
                .with_source("query_service"),
        );
        let msg = err.to_string();
        assert!(msg.contains("query must not be empty"));
        assert!(msg.contains("field: request.query"));
        assert!(msg.contains("source: query_service"));
    }

    #[test]
    fn test_aggregate_error_names_every_provider() {
        let err = Error::AllProvidersFailed {
            attempts: vec![
                ProviderAttempt {
                    provider: "openai".into(),
                    tier: ProviderTier::Primary,
                    class: ErrorClass::Timeout,
                    message: "deadline elapsed".into(),
                },
                ProviderAttempt {
                    provider: "anthropic".into(),
                    tier: ProviderTier::Fallback,
                    class: ErrorClass::Unavailable,
                    message: "503".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("openai (primary): deadline elapsed [timeout]"));
        assert!(msg.contains("anthropic (fallback): 503 [unavailable]"));
    }

    #[test]
    fn test_breaker_relevance() {
        assert!(Error::provider("p", ErrorClass::Timeout, "t").trips_breaker());
        assert!(Error::deadline_exceeded("worker").trips_breaker());
        assert!(!Error::circuit_open("dispatch").trips_breaker());
        assert!(!Error::validation_with_context("bad", ErrorContext::new()).trips_breaker());
        assert!(!Error::cancelled("dispatch").trips_breaker());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::deadline_exceeded("x").code(), "TIMEOUT");
        assert_eq!(Error::QueueFull { capacity: 1 }.code(), "QUEUE_FULL");
        assert!(Error::rate_limited("x").is_admission());
        assert!(!Error::ShuttingDown.is_admission());
    }
}
