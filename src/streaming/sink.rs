//! Event sinks.
//!
//! A sink is the transport-facing end of a stream session: an SSE writer, a
//! WebSocket, a channel to another task. The session serialises all calls,
//! so implementations take `&mut self` and need no locking of their own.

use super::event::{StreamEvent, StreamEventType};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[async_trait]
pub trait EventSink: Send {
    async fn write_event(&mut self, event: &StreamEvent) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await
    }
}

fn sink_error(msg: &str, source: &str) -> Error {
    Error::sink_with_context(msg, ErrorContext::new().with_source(source))
}

// ---------------------------------------------------------------------------
// Buffered

/// Buffers events and forwards them to an inner sink in batches.
///
/// The buffer is flushed when it reaches `batch_size`, on every heartbeat
/// (a buffered heartbeat would not keep the connection alive), on terminal
/// events, and on close.
pub struct BufferedSink<S: EventSink> {
    inner: S,
    buffer: Vec<StreamEvent>,
    batch_size: usize,
}

impl<S: EventSink> BufferedSink<S> {
    pub fn new(inner: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            inner,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: EventSink> EventSink for BufferedSink<S> {
    async fn write_event(&mut self, event: &StreamEvent) -> Result<()> {
        self.buffer.push(event.clone());
        let urgent = event.is_terminal() || event.event_type == StreamEventType::Heartbeat;
        if urgent || self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        for event in self.buffer.drain(..) {
            self.inner.write_event(&event).await?;
        }
        self.inner.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// Channel

/// What a [`ChannelSink`] does when its consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to make room.
    #[default]
    Block,
    /// Evict the oldest queued event to make room.
    DropOldest,
    /// Discard the event being written.
    DropNewest,
}

struct Shared {
    queue: Mutex<VecDeque<StreamEvent>>,
    capacity: usize,
    items: Notify,
    space: Notify,
    sender_closed: AtomicBool,
    receiver_gone: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<StreamEvent>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Bounded, policy-driven channel to a consumer task.
pub struct ChannelSink {
    shared: Arc<Shared>,
    policy: OverflowPolicy,
}

/// Consumer end of a [`ChannelSink`].
pub struct EventReceiver {
    shared: Arc<Shared>,
}

/// Create a bounded sink/receiver pair.
pub fn channel_sink(capacity: usize, policy: OverflowPolicy) -> (ChannelSink, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        capacity: capacity.max(1),
        items: Notify::new(),
        space: Notify::new(),
        sender_closed: AtomicBool::new(false),
        receiver_gone: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        ChannelSink {
            shared: Arc::clone(&shared),
            policy,
        },
        EventReceiver { shared },
    )
}

impl ChannelSink {
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Events discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write_event(&mut self, event: &StreamEvent) -> Result<()> {
        loop {
            {
                if self.shared.receiver_gone.load(Ordering::Acquire) {
                    return Err(sink_error("stream consumer disconnected", "channel_sink"));
                }
                let mut queue = self.shared.queue();
                if queue.len() < self.shared.capacity {
                    queue.push_back(event.clone());
                    self.shared.items.notify_one();
                    return Ok(());
                }
                match self.policy {
                    OverflowPolicy::DropNewest => {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(event.clone());
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        self.shared.items.notify_one();
                        return Ok(());
                    }
                    OverflowPolicy::Block => {}
                }
            }
            // Single producer: a pop between the check and this await leaves a stored permit.
            self.shared.space.notified().await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.sender_closed.store(true, Ordering::Release);
        self.shared.items.notify_one();
        Ok(())
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        self.shared.sender_closed.store(true, Ordering::Release);
        self.shared.items.notify_one();
    }
}

impl EventReceiver {
    /// Next event, or `None` once the sink is closed and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            {
                let mut queue = self.shared.queue();
                if let Some(ev) = queue.pop_front() {
                    self.shared.space.notify_one();
                    return Some(ev);
                }
                if self.shared.sender_closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.shared.items.notified().await;
        }
    }

    /// Drain whatever is queued right now without waiting.
    pub fn try_drain(&mut self) -> Vec<StreamEvent> {
        let drained: Vec<_> = self.shared.queue().drain(..).collect();
        if !drained.is_empty() {
            self.shared.space.notify_one();
        }
        drained
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures::stream::unfold(self, |mut rx| async move {
            let ev = rx.recv().await?;
            Some((ev, rx))
        })
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.shared.receiver_gone.store(true, Ordering::Release);
        self.shared.space.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Memory

#[derive(Default)]
struct MemoryState {
    events: Vec<StreamEvent>,
    flushes: usize,
    closed: bool,
}

/// Collects events in memory. Clones share the same log.
///
/// Failure injection makes it useful for exercising sink-error paths.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    fail_after: Option<usize>,
    fail_heartbeats: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `n` events, then fail every write.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    /// Fail every heartbeat write; other events are accepted.
    pub fn failing_heartbeats() -> Self {
        Self {
            fail_heartbeats: true,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.state().events.clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.state().events.iter().map(|e| e.sequence).collect()
    }

    pub fn count(&self, kind: StreamEventType) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| e.event_type == kind)
            .count()
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn write_event(&mut self, event: &StreamEvent) -> Result<()> {
        let mut state = self.state();
        if self.fail_heartbeats && event.event_type == StreamEventType::Heartbeat {
            return Err(sink_error("heartbeat write failed", "memory_sink"));
        }
        if self.fail_after.is_some_and(|n| state.events.len() >= n) {
            return Err(sink_error("write failed", "memory_sink"));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.state().flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.flushes += 1;
        state.closed = true;
        Ok(())
    }
}
