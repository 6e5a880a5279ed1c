//! # Providers Module
//!
//! Remote model providers behind one async trait, ordered into tiers and
//! walked by the [`router::FallbackRouter`].
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Provider`] | One `invoke` call, whatever the transport |
//! | [`classification`] | Retryable vs fatal failure classes |
//! | [`router`] | Primary → fallback → local walk with degraded labelling |
//! | [`simulated`] | Scripted in-process provider for demos and tests |

pub mod classification;
pub mod router;
pub mod simulated;

pub use classification::ErrorClass;
pub use router::{FallbackRouter, RoutedResponse, RouterConfig};
pub use simulated::{SimulatedProvider, SimulatedStep};

use crate::context::RequestContext;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Closed set of provider tiers, walked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    Primary,
    Fallback,
    Local,
}

impl ProviderTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTier::Primary => "primary",
            ProviderTier::Fallback => "fallback",
            ProviderTier::Local => "local",
        }
    }
}

impl std::fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a processor sends to a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub request_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// What a provider returns on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub tokens_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Which provider answered, and why it was not the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServedBy {
    pub provider: String,
    pub tier: ProviderTier,
    /// Set only when a non-primary tier answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl ServedBy {
    pub fn is_degraded(&self) -> bool {
        self.tier != ProviderTier::Primary
    }
}

/// A remote (or local) model provider.
///
/// Implementations report failures as [`crate::Error::Provider`] with a
/// classified [`ErrorClass`]; any other error is classified from its message.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, ctx: &RequestContext, request: &ProviderRequest) -> Result<ProviderResponse>;
}

/// A provider placed at a tier.
#[derive(Clone)]
pub struct ProviderSlot {
    pub tier: ProviderTier,
    pub provider: Arc<dyn Provider>,
}

impl ProviderSlot {
    pub fn new(tier: ProviderTier, provider: Arc<dyn Provider>) -> Self {
        Self { tier, provider }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }
}

impl std::fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("tier", &self.tier)
            .field("provider", &self.provider.name())
            .finish()
    }
}
