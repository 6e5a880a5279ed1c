use super::session::{session_closed, StreamSession};
use crate::config::StreamingConfig;
use crate::context::RequestContext;
use crate::types::QueryResponse;
use crate::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a terminal error event may take once the session deadline has passed.
const TERMINAL_GRACE: Duration = Duration::from_millis(500);

/// A result that can be delivered as chunks followed by a completion payload.
pub trait Streamable {
    /// Text delivered incrementally as `chunk` events.
    fn stream_text(&self) -> &str;

    /// Payload of the `complete` event.
    fn completion(&self) -> Result<Value>;
}

impl Streamable for QueryResponse {
    fn stream_text(&self) -> &str {
        &self.sql
    }

    fn completion(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Runs one unit of work inside a stream session.
///
/// The session sees `start`, then whatever progress the work reports,
/// heartbeats on an independent timer until the terminal event, then either
/// `chunk`* + `complete` or a single `error`. A failed sink write cancels the
/// work, is reported as a best-effort `error` event, closes the sink, and the
/// run returns the sink error.
#[derive(Debug, Clone)]
pub struct StreamPipeline {
    heartbeat_interval: Duration,
    chunk_size: usize,
}

impl StreamPipeline {
    pub fn new(heartbeat_interval: Duration, chunk_size: usize) -> Self {
        Self {
            heartbeat_interval,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(cfg: &StreamingConfig) -> Self {
        Self::new(cfg.heartbeat_interval, cfg.chunk_size)
    }

    pub async fn run<T, F, Fut>(
        &self,
        session: Arc<StreamSession>,
        ctx: &RequestContext,
        metadata: Option<Value>,
        work: F,
    ) -> Result<T>
    where
        T: Streamable,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match session.start(metadata).await {
            Ok(true) => {}
            Ok(false) => return Err(session_closed(session.id())),
            Err(err) => {
                self.abort(&session, &err).await;
                return Err(err);
            }
        }

        let work_ctx = ctx.child();
        let stop = CancellationToken::new();
        let heartbeat_failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&session),
            self.heartbeat_interval,
            stop.clone(),
            work_ctx.clone(),
            Arc::clone(&heartbeat_failure),
        ));

        let outcome = work_ctx.run("stream_pipeline", work(work_ctx.clone())).await.and_then(|r| r);
        let result = match outcome {
            Ok(value) => {
                let delivered = self.deliver(&session, ctx, &value).await;
                delivered.map(|()| value)
            }
            Err(err) => {
                self.terminate(&session, &err).await;
                Err(err)
            }
        };

        // Heartbeats cover delivery too; they stop between ticks, never mid-write.
        stop.cancel();
        if tokio::time::timeout(TERMINAL_GRACE, &mut heartbeat).await.is_err() {
            debug!(session_id = session.id(), "heartbeat stuck on a blocked sink, aborting it");
            heartbeat.abort();
        }

        let hb_err = heartbeat_failure.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(err) = hb_err {
            warn!(session_id = session.id(), error = %err, "heartbeat failed, stream aborted");
            self.abort(&session, &err).await;
            return Err(err);
        }
        result
    }

    async fn deliver<T: Streamable>(
        &self,
        session: &StreamSession,
        ctx: &RequestContext,
        value: &T,
    ) -> Result<()> {
        for (index, chunk) in chunk_text(value.stream_text(), self.chunk_size).enumerate() {
            if let Err(err) = ctx.check("stream_pipeline") {
                self.terminate(session, &err).await;
                return Err(err);
            }
            match session.chunk(index, chunk).await {
                Ok(true) => {}
                Ok(false) => return Err(session_closed(session.id())),
                Err(err) => {
                    self.abort(session, &err).await;
                    return Err(err);
                }
            }
        }
        let data = match value.completion() {
            Ok(data) => data,
            Err(err) => {
                self.terminate(session, &err).await;
                return Err(err);
            }
        };
        match session.complete(data, None).await {
            Ok(true) => {}
            Ok(false) => return Err(session_closed(session.id())),
            Err(err) => {
                self.abort(session, &err).await;
                return Err(err);
            }
        }
        debug!(
            session_id = session.id(),
            events = session.emitted(),
            elapsed_ms = session.elapsed().as_millis() as u64,
            "stream complete"
        );
        Ok(())
    }

    /// Best-effort terminal error event. Bounded by a short grace period so a
    /// stalled consumer cannot hold the caller past its deadline.
    async fn terminate(&self, session: &StreamSession, err: &Error) {
        match tokio::time::timeout(TERMINAL_GRACE, session.fail(err)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(session_id = session.id(), error = %e, "terminal error event not delivered"),
            Err(_) => debug!(session_id = session.id(), "terminal error event timed out"),
        }
    }

    /// Ends a session whose sink failed: one bounded Error event attempt, then close.
    async fn abort(&self, session: &StreamSession, err: &Error) {
        match tokio::time::timeout(TERMINAL_GRACE, session.abort(err)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(session_id = session.id(), error = %e, "sink error event not delivered"),
            Err(_) => {
                debug!(session_id = session.id(), "sink error event timed out");
                let _ = tokio::time::timeout(TERMINAL_GRACE, session.close()).await;
            }
        }
    }
}

async fn heartbeat_loop(
    session: Arc<StreamSession>,
    every: Duration,
    stop: CancellationToken,
    work_ctx: RequestContext,
    failure: Arc<Mutex<Option<Error>>>,
) {
    // First tick one period from now, not immediately.
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match session.heartbeat().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
                work_ctx.cancel();
                return;
            }
        }
    }
}

/// Split on char boundaries into pieces of at most `size` characters.
fn chunk_text(text: &str, size: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .char_indices()
            .nth(size)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}
