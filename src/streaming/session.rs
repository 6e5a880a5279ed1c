use super::event::{StreamError, StreamEvent, StreamEventType};
use super::sink::EventSink;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Receives progress updates from code that runs while a stream is open.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Report that `stage` reached `percent` (0–100). Non-increasing values are ignored.
    async fn report_progress(&self, stage: &str, percent: f32) -> Result<()>;
}

struct Inner {
    sink: Box<dyn EventSink>,
    next_sequence: u64,
    last_progress: Option<f32>,
    terminal: bool,
    write_failed: bool,
    closed: bool,
}

/// One client-facing event stream.
///
/// Every event is numbered and written to the sink under a single lock, so
/// the sink sees events in sequence order. Sequence numbers start at 1 and
/// a number is committed only once its write returns `Ok`, so a failed or
/// cancelled write never leaves a gap. After Complete or Error (or a failed
/// write) further emits are no-ops that return `Ok(false)`; [`abort`] is the
/// one way to still report an error after a failed write.
///
/// [`abort`]: StreamSession::abort
pub struct StreamSession {
    id: String,
    started_at: Instant,
    inner: Mutex<Inner>,
    terminated: AtomicBool,
    emitted: AtomicU64,
}

impl StreamSession {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sink)
    }

    pub fn with_id(id: impl Into<String>, sink: Box<dyn EventSink>) -> Self {
        Self {
            id: id.into(),
            started_at: Instant::now(),
            inner: Mutex::new(Inner {
                sink,
                next_sequence: 1,
                last_progress: None,
                terminal: false,
                write_failed: false,
                closed: false,
            }),
            terminated: AtomicBool::new(false),
            emitted: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Events successfully written so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    async fn emit(
        &self,
        kind: StreamEventType,
        data: Option<Value>,
        error: Option<StreamError>,
        metadata: Option<Value>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.terminal {
            return Ok(false);
        }
        self.emit_locked(&mut inner, kind, data, error, metadata).await
    }

    async fn emit_locked(
        &self,
        inner: &mut Inner,
        kind: StreamEventType,
        data: Option<Value>,
        error: Option<StreamError>,
        metadata: Option<Value>,
    ) -> Result<bool> {
        let sequence = inner.next_sequence;
        let mut event = StreamEvent::new(&self.id, kind, sequence);
        event.data = data;
        event.error = error;
        event.metadata = metadata;

        if let Err(e) = inner.sink.write_event(&event).await {
            inner.terminal = true;
            inner.write_failed = true;
            self.terminated.store(true, Ordering::Release);
            debug!(session_id = self.id.as_str(), sequence, kind = kind.as_str(), "stream write failed");
            return Err(e);
        }
        inner.next_sequence += 1;
        self.emitted.fetch_add(1, Ordering::Relaxed);

        if kind.is_terminal() {
            inner.terminal = true;
            self.terminated.store(true, Ordering::Release);
            // Terminal event delivered; flush and close are best effort from here.
            Self::close_locked(inner).await;
        }
        Ok(true)
    }

    async fn close_locked(inner: &mut Inner) {
        if !inner.closed {
            inner.closed = true;
            let _ = inner.sink.close().await;
        }
    }

    pub async fn start(&self, metadata: Option<Value>) -> Result<bool> {
        self.emit(StreamEventType::Start, None, None, metadata).await
    }

    /// Emit progress only if `percent` is strictly greater than the last one sent.
    pub async fn progress(&self, stage: &str, percent: f32) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.terminal || inner.last_progress.is_some_and(|last| percent <= last) {
            return Ok(false);
        }
        inner.last_progress = Some(percent);
        self.emit_locked(
            &mut inner,
            StreamEventType::Progress,
            Some(json!({ "stage": stage, "percent": percent })),
            None,
            None,
        )
        .await
    }

    pub async fn heartbeat(&self) -> Result<bool> {
        self.emit(
            StreamEventType::Heartbeat,
            Some(json!({ "elapsedMs": self.elapsed().as_millis() as u64 })),
            None,
            None,
        )
        .await
    }

    pub async fn chunk(&self, index: usize, content: &str) -> Result<bool> {
        self.emit(
            StreamEventType::Chunk,
            Some(json!({ "index": index, "content": content })),
            None,
            None,
        )
        .await
    }

    pub async fn complete(&self, data: Value, metadata: Option<Value>) -> Result<bool> {
        self.emit(StreamEventType::Complete, Some(data), None, metadata).await
    }

    pub async fn fail(&self, err: &Error) -> Result<bool> {
        self.emit(StreamEventType::Error, None, Some(StreamError::from(err)), None)
            .await
    }

    /// End the session because of `err`, typically a failed sink write.
    ///
    /// Unless a terminal event was already delivered, one Error event is
    /// attempted even though the session is terminated. The sink is closed
    /// whatever the outcome. Returns whether the Error event was written.
    pub async fn abort(&self, err: &Error) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let delivered_terminal = inner.terminal && !inner.write_failed;
        let outcome = if delivered_terminal || inner.closed {
            Ok(false)
        } else {
            self.emit_locked(&mut inner, StreamEventType::Error, None, Some(StreamError::from(err)), None)
                .await
        };
        inner.terminal = true;
        self.terminated.store(true, Ordering::Release);
        Self::close_locked(&mut inner).await;
        outcome
    }

    /// Terminate without emitting anything and close the sink.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.terminal = true;
        self.terminated.store(true, Ordering::Release);
        Self::close_locked(&mut inner).await;
    }

    /// Flush the sink, unless the session already ended.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.terminal {
            return Ok(());
        }
        inner.sink.flush().await
    }
}

#[async_trait]
impl ProgressReporter for StreamSession {
    async fn report_progress(&self, stage: &str, percent: f32) -> Result<()> {
        self.progress(stage, percent).await.map(|_| ())
    }
}

/// Reporter for non-streaming calls.
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report_progress(&self, _stage: &str, _percent: f32) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn session_closed(session_id: &str) -> Error {
    Error::sink_with_context(
        "stream session already terminated",
        ErrorContext::new()
            .with_details(format!("session_id: {}", session_id))
            .with_source("stream_session"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::sink::{channel_sink, MemorySink, OverflowPolicy};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let mem = MemorySink::new();
        let s = StreamSession::new(Box::new(mem.clone()));
        s.start(None).await.unwrap();
        s.progress("intent", 10.0).await.unwrap();
        s.chunk(0, "SELECT 1").await.unwrap();
        s.complete(json!({"sql": "SELECT 1"}), None).await.unwrap();
        assert_eq!(mem.sequences(), vec![1, 2, 3, 4]);
        assert!(mem.is_closed());
    }

    #[tokio::test]
    async fn test_progress_must_strictly_increase() {
        let mem = MemorySink::new();
        let s = StreamSession::new(Box::new(mem.clone()));
        assert!(s.progress("a", 10.0).await.unwrap());
        assert!(!s.progress("a", 10.0).await.unwrap());
        assert!(!s.progress("a", 5.0).await.unwrap());
        assert!(s.progress("b", 50.0).await.unwrap());
        assert_eq!(mem.count(StreamEventType::Progress), 2);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_event() {
        let mem = MemorySink::new();
        let s = StreamSession::new(Box::new(mem.clone()));
        s.start(None).await.unwrap();
        s.fail(&Error::deadline_exceeded("stream")).await.unwrap();
        assert!(s.is_terminated());
        assert!(!s.heartbeat().await.unwrap());
        assert!(!s.complete(json!({}), None).await.unwrap());
        let events = mem.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].error.as_ref().unwrap().code, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_failed_write_terminates_session() {
        let mem = MemorySink::failing_after(1);
        let s = StreamSession::new(Box::new(mem.clone()));
        s.start(None).await.unwrap();
        assert!(s.chunk(0, "x").await.is_err());
        assert!(s.is_terminated());
        assert!(!s.chunk(1, "y").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_does_not_consume_a_sequence() {
        let mem = MemorySink::failing_heartbeats();
        let s = StreamSession::new(Box::new(mem.clone()));
        s.start(None).await.unwrap();
        assert!(s.heartbeat().await.is_err());

        assert!(s.abort(&Error::sink_with_context("heartbeat write failed", ErrorContext::new())).await.unwrap());
        assert_eq!(mem.sequences(), vec![1, 2]);
        assert_eq!(mem.events()[1].error.as_ref().unwrap().code, "SINK_ERROR");
        assert!(mem.is_closed());
        assert!(!s.complete(json!({}), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_write_does_not_consume_a_sequence() {
        let (sink, mut rx) = channel_sink(1, OverflowPolicy::Block);
        let s = StreamSession::new(Box::new(sink));
        s.start(None).await.unwrap();

        // Queue is full, so the heartbeat blocks until it is dropped.
        let blocked = tokio::time::timeout(Duration::from_millis(20), s.heartbeat()).await;
        assert!(blocked.is_err());
        assert!(!s.is_terminated());

        assert_eq!(rx.recv().await.map(|e| e.sequence), Some(1));
        s.complete(json!({}), None).await.unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(next.sequence, 2);
        assert_eq!(next.event_type, StreamEventType::Complete);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_after_terminal_event_only_closes() {
        let mem = MemorySink::new();
        let s = StreamSession::new(Box::new(mem.clone()));
        s.start(None).await.unwrap();
        s.complete(json!({}), None).await.unwrap();
        assert!(!s.abort(&Error::sink_with_context("late", ErrorContext::new())).await.unwrap());
        assert_eq!(mem.count(StreamEventType::Error), 0);
        assert!(mem.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_emitters_keep_sink_order() {
        let mem = MemorySink::new();
        let s = Arc::new(StreamSession::new(Box::new(mem.clone())));
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&s);
                tokio::spawn(async move {
                    for j in 0..25 {
                        if (i + j) % 2 == 0 {
                            s.heartbeat().await.unwrap();
                        } else {
                            s.chunk(j, "x").await.unwrap();
                        }
                    }
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        let seqs = mem.sequences();
        assert_eq!(seqs.len(), 200);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(s.emitted(), 200);
    }
}
