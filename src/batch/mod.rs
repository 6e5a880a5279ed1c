//! # Batch Module
//!
//! Results of [`crate::dispatch::DispatchCoordinator::dispatch_batch`]. Every
//! item runs through the same admission path and worker pool as a single
//! call; the report keeps the input order and carries per-item errors inline.

mod report;

pub use report::BatchReport;
