//! # Telemetry Module
//!
//! Logging setup and in-process recorders for usage and feedback.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`init_tracing`] | Installs a `tracing-subscriber` fmt layer driven by `RUST_LOG` |
//! | [`InMemoryUsageRecorder`] | Bounded in-memory usage log, for tests and demos |
//! | [`InMemoryFeedbackRecorder`] | Bounded in-memory feedback log |
//! | [`TracingUsageRecorder`] | Emits each usage record as a structured log line |

use crate::collaborators::{FeedbackEvent, FeedbackRecorder, UsageRecord, UsageRecorder};
use crate::Result;
use async_trait::async_trait;
use std::sync::RwLock;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. `RUST_LOG` overrides the default `info` level.
///
/// Calling it twice is harmless; the second call leaves the first subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub struct InMemoryUsageRecorder {
    records: RwLock<Vec<UsageRecord>>,
    max_records: usize,
}

impl InMemoryUsageRecorder {
    pub fn new(max: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            max_records: max,
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn total_tokens(&self) -> u64 {
        self.records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|r| r.tokens_used as u64)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsageRecorder {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.push(record);
        if records.len() > self.max_records {
            records.remove(0);
        }
        Ok(())
    }
}

pub struct InMemoryFeedbackRecorder {
    events: RwLock<Vec<FeedbackEvent>>,
    max_events: usize,
}

impl InMemoryFeedbackRecorder {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        self.events.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn events_for(&self, request_id: &str) -> Vec<FeedbackEvent> {
        self.events
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.request_id() == request_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FeedbackRecorder for InMemoryFeedbackRecorder {
    async fn record_feedback(&self, event: FeedbackEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}

pub struct TracingUsageRecorder;

#[async_trait]
impl UsageRecorder for TracingUsageRecorder {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        tracing::info!(
            request_id = record.request_id.as_str(),
            provider = record.provider.as_deref().unwrap_or("-"),
            tier = record.tier.map(|t| t.as_str()).unwrap_or("-"),
            tokens = record.tokens_used,
            latency_ms = record.latency_ms,
            cache_hit = record.cache_hit,
            success = record.success,
            "usage"
        );
        Ok(())
    }
}
