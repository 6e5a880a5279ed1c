//! # Streaming Delivery Module
//!
//! Progressive results for one request, delivered as an ordered event stream.
//!
//! ```text
//! start → (progress | heartbeat | chunk)* → complete | error
//! ```
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`event`] | Wire schema (`id`, `type`, `data`, `error`, `sequence`, `isComplete`, …) |
//! | [`sink`] | [`EventSink`] trait plus buffered, channel and in-memory sinks |
//! | [`session`] | Sequence numbering, progress monotonicity and the terminal guard |
//! | [`pipeline`] | Heartbeat timer, cancellation, chunked delivery, timeout events |
//!
//! ```rust
//! use nl2sql_runtime::streaming::{channel_sink, OverflowPolicy, StreamSession};
//!
//! # #[tokio::main]
//! # async fn main() -> nl2sql_runtime::Result<()> {
//! let (sink, mut rx) = channel_sink(64, OverflowPolicy::Block);
//! let session = StreamSession::new(Box::new(sink));
//! session.start(None).await?;
//! session.heartbeat().await?;
//!
//! assert_eq!(rx.recv().await.map(|e| e.sequence), Some(1));
//! assert_eq!(rx.recv().await.map(|e| e.sequence), Some(2));
//! # Ok(())
//! # }
//! ```

pub mod event;
pub mod pipeline;
pub mod session;
pub mod sink;

pub use event::{StreamError, StreamEvent, StreamEventType};
pub use pipeline::{StreamPipeline, Streamable};
pub use session::{NoopProgress, ProgressReporter, StreamSession};
pub use sink::{
    channel_sink, BufferedSink, ChannelSink, EventReceiver, EventSink, MemorySink, OverflowPolicy,
};
