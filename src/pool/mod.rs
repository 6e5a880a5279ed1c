//! # Pooling Module
//!
//! Execution resources shared by every dispatch call.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`object_pool`] | Recycled per-request processors, reset on return |
//! | [`worker_pool`] | Fixed worker set draining a bounded job queue |
//!
//! The worker pool is the only place handlers run, which is what bounds
//! in-flight work to the configured worker count.

pub mod object_pool;
pub mod worker_pool;

pub use object_pool::{ObjectPool, ObjectPoolStats, Pooled, Reusable};
pub use worker_pool::{
    Job, JobHandler, JobInput, JobResult, JobTicket, QueueFullPolicy, ShutdownMode, WorkerPool,
    WorkerPoolConfig, WorkerPoolStats,
};
