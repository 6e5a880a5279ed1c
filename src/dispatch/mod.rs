//! # Dispatch Module
//!
//! The admission-controlled path from an inbound request to a provider answer.
//!
//! ```text
//! request → breaker → rate limiter → worker pool → QueryProcessor → FallbackRouter
//!                                                        ↓
//!          breaker ← outcome ← result slot ← processor reset and returned
//! ```
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`coordinator`] | Admission, submission, outcome accounting, batch fan-out |
//! | [`processor`] | Per-request pipeline run on a worker with a pooled processor |
//! | [`metrics`] | Point-in-time engine snapshot |

pub mod coordinator;
pub mod metrics;
pub mod processor;

pub use coordinator::DispatchCoordinator;
pub use metrics::DispatchMetrics;
pub use processor::{DispatchJob, ProcessorDeps, QueryHandler, QueryProcessor};
