use crate::context::RequestContext;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest refill tick; faster rates add several permits per tick instead.
const MIN_REFILL_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub rate: f64,
    pub capacity: u32,
    pub available: u32,
    pub unlimited: bool,
    /// Estimated wait time until a permit is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Permits added per second. `0` selects unlimited mode.
    pub rate: f64,
    /// Maximum number of buffered permits (burst size).
    pub capacity: u32,
    /// Whether a background task refills the buffer.
    pub refill: bool,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            rate: rps,
            capacity: (rps.ceil() as u32).max(1), // default burst: 1 second worth, at least 1
            refill: true,
        })
    }

    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            rate: 10.0,
            capacity: 10,
            refill: true,
        }
    }

    /// Set the maximum buffered permits
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the refill rate (permits per second)
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Disable the background refiller; permits only come back through `refill_one`.
    pub fn without_refill(mut self) -> Self {
        self.refill = false;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    /// Interval between refill ticks, and permits added per tick.
    pub fn refill_schedule(&self) -> Option<(Duration, u32)> {
        if self.is_unlimited() || !self.rate.is_finite() {
            return None;
        }
        let period = Duration::from_secs_f64(1.0 / self.rate);
        if period >= MIN_REFILL_TICK {
            Some((period, 1))
        } else {
            // Whole permits per tick, with the tick stretched so per_tick / tick never exceeds rate.
            let per_tick = (self.rate * MIN_REFILL_TICK.as_secs_f64()).ceil().max(1.0);
            let tick = Duration::from_nanos((per_tick * 1e9 / self.rate).ceil() as u64);
            Some((tick.max(MIN_REFILL_TICK), per_tick as u32))
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct Bucket {
    permits: Semaphore,
    capacity: u32,
    // Serialises producers so a refill tick and a manual refill cannot both
    // observe spare room and overshoot capacity. Consumers only ever remove.
    refill_lock: std::sync::Mutex<()>,
}

impl Bucket {
    /// Add up to `n` permits, dropping whatever does not fit.
    fn add(&self, n: u32) -> u32 {
        let _guard = self
            .refill_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let available = self.permits.available_permits() as u32;
        let room = self.capacity.saturating_sub(available);
        let added = n.min(room);
        if added > 0 {
            self.permits.add_permits(added as usize);
        }
        added
    }
}

/// Token-bucket admission gate.
///
/// The bucket starts full. One permit is added every `1s / rate` by a
/// background task spawned on construction; when the buffer is already at
/// capacity the permit is dropped, so bursts never exceed `capacity`.
/// `rate == 0` is an explicit unlimited mode with no refiller.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    bucket: Arc<Bucket>,
    refiller: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// Build the limiter. The refiller is spawned on the current Tokio runtime, if any.
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let capacity = cfg.capacity.max(1);
        let cfg = RateLimiterConfig { capacity, ..cfg };
        let bucket = Arc::new(Bucket {
            permits: Semaphore::new(capacity as usize),
            capacity,
            refill_lock: std::sync::Mutex::new(()),
        });

        let refiller = match (cfg.refill, cfg.refill_schedule()) {
            (true, Some((tick, per_tick))) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(refill_loop(Arc::clone(&bucket), tick, per_tick))),
                Err(_) => {
                    warn!(
                        rate = cfg.rate,
                        "no Tokio runtime available, rate limiter refill disabled"
                    );
                    None
                }
            },
            _ => None,
        };

        Self {
            cfg,
            bucket,
            refiller,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(RateLimiterConfig::new().with_rate(0.0))
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    pub fn is_unlimited(&self) -> bool {
        self.cfg.is_unlimited()
    }

    /// Take a permit if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        match self.bucket.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for a permit until one is available or `ctx` ends.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<()> {
        if self.is_unlimited() {
            return ctx.check("rate_limiter");
        }
        let permit = ctx
            .run("rate_limiter", self.bucket.permits.acquire())
            .await?
            .map_err(|_| {
                Error::runtime_with_context(
                    "rate limiter closed",
                    ErrorContext::new().with_source("rate_limiter"),
                )
            })?;
        permit.forget();
        Ok(())
    }

    /// Return one permit to the buffer by hand. Dropped if the buffer is full.
    pub fn refill_one(&self) -> bool {
        self.bucket.add(1) == 1
    }

    /// Permits currently buffered.
    pub fn available(&self) -> u32 {
        if self.is_unlimited() {
            return self.cfg.capacity;
        }
        self.bucket.permits.available_permits() as u32
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let available = self.available();
        let estimated_wait_ms = if available == 0 {
            self.cfg
                .refill_schedule()
                .filter(|_| self.refiller.is_some())
                .map(|(tick, _)| tick.as_millis() as u64)
        } else {
            None
        };
        RateLimiterSnapshot {
            rate: self.cfg.rate,
            capacity: self.cfg.capacity,
            available,
            unlimited: self.is_unlimited(),
            estimated_wait_ms,
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.refiller.take() {
            handle.abort();
        }
    }
}

async fn refill_loop(bucket: Arc<Bucket>, tick: Duration, per_tick: u32) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the bucket already starts full.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if bucket.add(per_tick) == 0 {
            debug!("rate limiter buffer full, permit dropped");
        }
    }
}
