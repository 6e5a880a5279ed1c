use crate::providers::ServedBy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub use_cache: bool,
    pub include_explanation: bool,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            include_explanation: false,
            max_tokens: None,
            model: None,
        }
    }
}

/// An inbound natural-language question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default = "new_request_id")]
    pub request_id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            query: query.into(),
            connection_id: None,
            user_id: None,
            conversation_id: None,
            options: QueryOptions::default(),
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.options.use_cache = false;
        self
    }
}

/// Timing and cost figures for one processed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub tokens_used: u32,
    pub total_time_ms: u64,
    pub queue_wait_ms: u64,
    pub downstream_ms: u64,
    pub validation_ms: u64,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub served_by: ServedBy,
    pub metrics: ProcessingMetrics,
}

impl QueryResponse {
    pub fn is_degraded(&self) -> bool {
        self.served_by.is_degraded()
    }
}
