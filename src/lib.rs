//! # nl2sql-runtime
//!
//! Admission-controlled dispatch engine and sequenced streaming delivery for a
//! natural-language-to-SQL backend.
//!
//! ## Overview
//!
//! Every inbound query passes a circuit breaker and a token-bucket rate
//! limiter, then runs on a bounded pool of long-lived workers. Each worker
//! borrows a reusable processor from an object pool, calls the external
//! collaborators (intent, schema context, prompt, validation) and asks the
//! fallback router for SQL: primary, then fallback, then local. The outcome
//! feeds the breaker and the metrics snapshot.
//!
//! The streaming entry point runs the same path and reports it as an ordered
//! event stream with heartbeats, progress, chunked SQL and a single terminal
//! event.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nl2sql_runtime::providers::SimulatedProvider;
//! use nl2sql_runtime::{QueryRequest, QueryService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nl2sql_runtime::Result<()> {
//!     let service = QueryService::builder()
//!         .config_from_env()
//!         .primary(Arc::new(SimulatedProvider::new("primary")))
//!         .local(Arc::new(SimulatedProvider::new("local")))
//!         .build()?;
//!
//!     let resp = service.process(QueryRequest::new("how many users signed up today")).await?;
//!     println!("{} (served by {})", resp.sql, resp.served_by.provider);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`service`] | `QueryService` and its builder: the exposed surface |
//! | [`dispatch`] | Coordinator, per-request processor, metrics snapshot |
//! | [`resilience`] | Circuit breaker and token-bucket rate limiter |
//! | [`pool`] | Object pool of reusable processors, bounded worker pool |
//! | [`providers`] | Provider trait, tiers, fallback router, error classification |
//! | [`streaming`] | Stream events, sinks, sessions, heartbeat pipeline |
//! | [`cache`] | TTL response cache keyed by normalised query |
//! | [`batch`] | Batch outcome report |
//! | [`collaborators`] | Consumed interfaces with no-op defaults |
//! | [`config`] | Serde config with env and YAML loading |
//! | [`context`] | Deadline and cancellation carried by every unit of work |
//! | [`telemetry`] | Tracing setup and in-memory recorders |
//! | [`types`] | Request and response types |

pub mod batch;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod pool;
pub mod providers;
pub mod resilience;
pub mod service;
pub mod streaming;
pub mod telemetry;
pub mod types;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

pub use batch::BatchReport;
pub use config::DispatchConfig;
pub use context::RequestContext;
pub use dispatch::{DispatchCoordinator, DispatchMetrics};
pub use service::{QueryService, QueryServiceBuilder};
pub use types::{ProcessingMetrics, QueryOptions, QueryRequest, QueryResponse};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
