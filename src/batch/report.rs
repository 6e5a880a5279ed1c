//! Batch outcome.

use crate::{Error, Result};
use std::time::Duration;

/// Outcome of a batch: one entry per input, in input order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub items: Vec<Result<T>>,
    pub execution_time: Duration,
}

impl<T> BatchReport<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            execution_time: Duration::ZERO,
        }
    }

    /// Per-item results as they came back, without collapsing.
    pub fn new(items: Vec<Result<T>>, execution_time: Duration) -> Self {
        Self {
            items,
            execution_time,
        }
    }

    /// Collapse per-item results. A non-empty batch in which every item
    /// failed becomes a single [`Error::BatchFailed`].
    pub fn from_results(items: Vec<Result<T>>, execution_time: Duration) -> Result<Self> {
        Self::new(items, execution_time).into_result()
    }

    /// Keep the report unless every item failed, in which case the item
    /// errors fold into one [`Error::BatchFailed`] carrying each item's code.
    pub fn into_result(self) -> Result<Self> {
        if self.items.is_empty() || self.items.iter().any(|r| r.is_ok()) {
            return Ok(self);
        }
        let errors: Vec<&Error> = self.items.iter().filter_map(|r| r.as_ref().err()).collect();
        Err(Error::BatchFailed {
            total: errors.len(),
            first: errors.first().map(|e| e.to_string()).unwrap_or_default(),
            codes: errors.iter().map(|e| e.code().to_string()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|r| r.is_ok())
    }

    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.items.len() - self.success_count()
    }

    pub fn success_rate(&self) -> f64 {
        if self.items.is_empty() {
            0.0
        } else {
            self.success_count() as f64 / self.items.len() as f64
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().ok().map(|v| (i, v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &Error)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self::empty()
    }
}
