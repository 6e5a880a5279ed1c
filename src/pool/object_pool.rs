//! Object pool for per-request processors.

use crate::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// An object that can be scrubbed back to a pristine state between uses.
pub trait Reusable: Send + 'static {
    /// Clear every trace of the previous request.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct ObjectPoolStats {
    pub idle: usize,
    pub outstanding: usize,
    pub created: u64,
    pub reused: u64,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct Inner<T> {
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    max_idle: usize,
    max_outstanding: Option<usize>,
    outstanding: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<T: Reusable> Inner<T> {
    fn put_back(&self, mut item: T) {
        item.reset();
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }
}

/// Recycles expensive processing objects across requests.
///
/// Objects are handed out as [`Pooled`] guards. Dropping the guard resets the
/// object and returns it, so the reset cannot be skipped on any return path,
/// including early returns and panics inside the holder.
pub struct ObjectPool<T: Reusable> {
    inner: Arc<Inner<T>>,
}

impl<T: Reusable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Reusable> ObjectPool<T> {
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(max_idle, None, Box::new(factory))
    }

    /// Like [`ObjectPool::new`], but caps the number of simultaneously checked-out objects.
    pub fn bounded<F>(max_idle: usize, max_outstanding: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(max_idle, Some(max_outstanding.max(1)), Box::new(factory))
    }

    fn build(max_idle: usize, max_outstanding: Option<usize>, factory: Factory<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                factory,
                max_idle,
                max_outstanding,
                outstanding: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Check an object out, creating one if none is idle.
    pub fn get(&self) -> Result<Pooled<T>> {
        let inner = &self.inner;
        let reserved = inner.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(max) = inner.max_outstanding {
            if reserved >= max {
                inner.outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::PoolExhausted { outstanding: reserved });
            }
        }

        let recycled = inner
            .idle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop();
        let item = match recycled {
            Some(item) => {
                inner.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                inner.created.fetch_add(1, Ordering::Relaxed);
                (inner.factory)()
            }
        };

        Ok(Pooled {
            item: Some(item),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn stats(&self) -> ObjectPoolStats {
        ObjectPoolStats {
            idle: self.inner.idle.lock().map(|v| v.len()).unwrap_or(0),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out pool object. Returned (after reset) on drop.
pub struct Pooled<T: Reusable> {
    item: Option<T>,
    pool: Arc<Inner<T>>,
}

impl<T: Reusable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `item` is only taken in `drop`.
        self.item.as_ref().expect("pooled object accessed after release")
    }
}

impl<T: Reusable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled object accessed after release")
    }
}

impl<T: Reusable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put_back(item);
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        buf: Vec<String>,
        resets: u32,
    }

    impl Reusable for Scratch {
        fn reset(&mut self) {
            self.buf.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn test_reuses_and_resets() {
        let pool = ObjectPool::new(4, Scratch::default);
        {
            let mut obj = pool.get().unwrap();
            obj.buf.push("SELECT secret FROM tenant_a".into());
        }
        let obj = pool.get().unwrap();
        assert!(obj.buf.is_empty());
        assert_eq!(obj.resets, 1);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.outstanding, 1);
    }

    #[test]
    fn test_reset_runs_on_panic_path() {
        let pool = ObjectPool::new(2, Scratch::default);
        let p = pool.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut obj = p.get().unwrap();
            obj.buf.push("leak".into());
            panic!("processor blew up");
        }));
        assert!(result.is_err());
        let obj = pool.get().unwrap();
        assert!(obj.buf.is_empty());
    }

    #[test]
    fn test_max_outstanding() {
        let pool = ObjectPool::bounded(1, 1, Scratch::default);
        let first = pool.get().unwrap();
        assert!(matches!(pool.get(), Err(Error::PoolExhausted { .. })));
        drop(first);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_idle_is_bounded() {
        let pool = ObjectPool::new(1, Scratch::default);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
