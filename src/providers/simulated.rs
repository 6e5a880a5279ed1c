//! Scripted provider for demos and tests.

use super::{ErrorClass, Provider, ProviderRequest, ProviderResponse};
use crate::context::RequestContext;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum SimulatedStep {
    /// Answer with this SQL after the configured latency.
    Answer(String),
    /// Fail with this class.
    Fail(ErrorClass, String),
    /// Sleep this long before answering (useful to trip deadlines).
    Stall(Duration),
}

/// Replays a script of outcomes, then keeps repeating a default answer.
pub struct SimulatedProvider {
    name: String,
    latency: Duration,
    tokens_per_call: u32,
    script: Mutex<VecDeque<SimulatedStep>>,
    fallback_sql: String,
    calls: AtomicU64,
}

impl SimulatedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            tokens_per_call: 42,
            script: Mutex::new(VecDeque::new()),
            fallback_sql: "SELECT 1".to_string(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens_per_call = tokens;
        self
    }

    pub fn with_default_sql(mut self, sql: impl Into<String>) -> Self {
        self.fallback_sql = sql.into();
        self
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = SimulatedStep>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(steps);
        self
    }

    /// A provider that fails every call with `class`.
    pub fn always_failing(name: impl Into<String>, class: ErrorClass) -> Self {
        let name = name.into();
        let steps = std::iter::repeat(SimulatedStep::Fail(class, format!("{} unavailable", name)))
            .take(1024)
            .collect::<Vec<_>>();
        Self::new(name).with_script(steps)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_step(&self) -> Option<SimulatedStep> {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    fn answer(&self, sql: String) -> ProviderResponse {
        ProviderResponse {
            sql,
            explanation: None,
            tokens_used: self.tokens_per_call,
            confidence: Some(0.9),
            model: Some(self.name.clone()),
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &RequestContext, _request: &ProviderRequest) -> Result<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            ctx.run("simulated_provider", tokio::time::sleep(self.latency)).await?;
        }
        match self.next_step() {
            Some(SimulatedStep::Answer(sql)) => Ok(self.answer(sql)),
            Some(SimulatedStep::Fail(class, message)) => Err(Error::provider(&self.name, class, message)),
            Some(SimulatedStep::Stall(d)) => {
                ctx.run("simulated_provider", tokio::time::sleep(d)).await?;
                Ok(self.answer(self.fallback_sql.clone()))
            }
            None => Ok(self.answer(self.fallback_sql.clone())),
        }
    }
}
