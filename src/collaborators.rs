//! External collaborators consumed by the query processor.
//!
//! Each concern sits behind a small async trait with a no-op (or trivial)
//! default, so the dispatch engine runs without any of them wired in.

use crate::providers::ProviderTier;
use crate::types::QueryRequest;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default)]
    pub history: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    /// Rewritten SQL to use instead of the generated one, if the validator sanitised it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_sql: Option<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
            sanitized_sql: None,
        }
    }

    pub fn rejected(issues: Vec<String>) -> Self {
        Self {
            valid: false,
            issues,
            sanitized_sql: None,
        }
    }
}

/// Inputs available to a prompt renderer.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub query: &'a str,
    pub intent: Option<&'a Intent>,
    pub context: &'a SchemaContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ProviderTier>,
    pub tokens_used: u32,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub success: bool,
    pub timestamp: f64,
}

/// Feedback events recorded for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedbackEvent {
    /// Emitted by the service after every request.
    Outcome {
        request_id: String,
        success: bool,
        degraded: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        timestamp: f64,
    },
    /// A user rating of the generated SQL.
    Rating {
        request_id: String,
        rating: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        timestamp: f64,
    },
    /// A user-supplied fix for the generated SQL.
    Correction {
        request_id: String,
        corrected_sql: String,
        timestamp: f64,
    },
}

impl FeedbackEvent {
    pub fn rating(request_id: impl Into<String>, rating: u32) -> Self {
        FeedbackEvent::Rating {
            request_id: request_id.into(),
            rating,
            comment: None,
            timestamp: timestamp(),
        }
    }

    pub fn correction(request_id: impl Into<String>, corrected_sql: impl Into<String>) -> Self {
        FeedbackEvent::Correction {
            request_id: request_id.into(),
            corrected_sql: corrected_sql.into(),
            timestamp: timestamp(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            FeedbackEvent::Outcome { request_id, .. }
            | FeedbackEvent::Rating { request_id, .. }
            | FeedbackEvent::Correction { request_id, .. } => request_id,
        }
    }
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify_intent(&self, query: &str) -> Result<Option<Intent>>;
}

#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build_context(&self, request: &QueryRequest) -> Result<SchemaContext>;
}

pub trait PromptRenderer: Send + Sync {
    fn render_prompt(&self, input: &PromptInput<'_>) -> Result<String>;
}

#[async_trait]
pub trait SqlValidator: Send + Sync {
    async fn validate(&self, sql: &str, request: &QueryRequest) -> Result<ValidationReport>;
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<()>;
}

#[async_trait]
pub trait FeedbackRecorder: Send + Sync {
    async fn record_feedback(&self, event: FeedbackEvent) -> Result<()>;
}

pub struct NoopIntentClassifier;

#[async_trait]
impl IntentClassifier for NoopIntentClassifier {
    async fn classify_intent(&self, _query: &str) -> Result<Option<Intent>> {
        Ok(None)
    }
}

pub struct NoopContextBuilder;

#[async_trait]
impl ContextBuilder for NoopContextBuilder {
    async fn build_context(&self, _request: &QueryRequest) -> Result<SchemaContext> {
        Ok(SchemaContext::default())
    }
}

/// Plain-text prompt: schema (if any), recent history, then the question.
pub struct TemplatePromptRenderer;

impl PromptRenderer for TemplatePromptRenderer {
    fn render_prompt(&self, input: &PromptInput<'_>) -> Result<String> {
        let mut prompt = String::new();
        if let Some(schema) = input.context.schema.as_deref() {
            prompt.push_str("Schema:\n");
            prompt.push_str(schema);
            prompt.push_str("\n\n");
        }
        if !input.context.history.is_empty() {
            prompt.push_str("Previous questions:\n");
            for h in &input.context.history {
                prompt.push_str("- ");
                prompt.push_str(h);
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        if let Some(intent) = input.intent {
            prompt.push_str(&format!("Intent: {}\n", intent.label));
        }
        prompt.push_str("Question: ");
        prompt.push_str(input.query);
        prompt.push_str("\nSQL:");
        Ok(prompt)
    }
}

/// Accepts everything.
pub struct NoopSqlValidator;

#[async_trait]
impl SqlValidator for NoopSqlValidator {
    async fn validate(&self, _sql: &str, _request: &QueryRequest) -> Result<ValidationReport> {
        Ok(ValidationReport::ok())
    }
}

pub struct NoopUsageRecorder;

#[async_trait]
impl UsageRecorder for NoopUsageRecorder {
    async fn record_usage(&self, _record: UsageRecord) -> Result<()> {
        Ok(())
    }
}

pub struct NoopFeedbackRecorder;

#[async_trait]
impl FeedbackRecorder for NoopFeedbackRecorder {
    async fn record_feedback(&self, _event: FeedbackEvent) -> Result<()> {
        Ok(())
    }
}

/// The full set of collaborators handed to processors.
#[derive(Clone)]
pub struct Collaborators {
    pub intent: Arc<dyn IntentClassifier>,
    pub context: Arc<dyn ContextBuilder>,
    pub prompt: Arc<dyn PromptRenderer>,
    pub validator: Arc<dyn SqlValidator>,
    pub usage: Arc<dyn UsageRecorder>,
    pub feedback: Arc<dyn FeedbackRecorder>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            intent: Arc::new(NoopIntentClassifier),
            context: Arc::new(NoopContextBuilder),
            prompt: Arc::new(TemplatePromptRenderer),
            validator: Arc::new(NoopSqlValidator),
            usage: Arc::new(NoopUsageRecorder),
            feedback: Arc::new(NoopFeedbackRecorder),
        }
    }
}
