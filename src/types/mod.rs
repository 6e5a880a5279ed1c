//! # Types Module
//!
//! Request and response types exchanged with callers of the query service.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`QueryRequest`] | Natural-language question plus routing hints |
//! | [`QueryResponse`] | Generated SQL, provenance and metrics |
//! | [`ProcessingMetrics`] | Per-request timing, tokens and cache-hit flag |

pub mod query;

pub use query::{ProcessingMetrics, QueryOptions, QueryRequest, QueryResponse};
