//! TokenSource contract: one backend model as an opaque token producer.
//!
//! Each backend implements [`TokenSource`]. A started stream is a
//! [`StreamHandle`]: a bounded receiver fed by a producer task plus a
//! cancellation token shared with that task.
//!
//! ## Lifecycle
//!
//! ```text
//! start_with_retry(source, ..)
//!   → health_check (bounded by timeout)   BackendUnavailable on failure
//!   → source.start(..)                    bounded, retried while BackendUnavailable
//!   → handle.next() ... handle.next()     ordered, validated TokenEvents
//!   → handle.cancel()                     idempotent, nothing after it
//! ```

pub mod openai;
pub mod retry;
pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::{ModelId, SequenceGuard, StreamId, TokenEvent};

pub use openai::{OpenAiConfig, OpenAiSource};
pub use retry::{start_with_retry, RetryPolicy};
pub use scripted::{Script, ScriptEnd, ScriptStep, ScriptedSource};

/// What a backend reports after materializing a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelFootprint {
    /// Approximate resident size in bytes (0 when the backend cannot tell).
    pub memory_estimate: u64,
}

/// Abstraction over one inference backend.
///
/// Implementations perform network or process I/O only; they never touch
/// pool or orchestrator state.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Cheap reachability check. Callers bound it with a timeout.
    async fn health_check(&self) -> EngineResult<()>;

    /// Materialize `model_id` on the backend.
    async fn load_model(&self, model_id: &ModelId) -> EngineResult<ModelFootprint>;

    /// Release a model the pool evicted. Best effort.
    async fn unload_model(&self, _model_id: &ModelId) {}

    /// Begin generating tokens for `prompt`. Each call starts a fresh stream.
    async fn start(
        &self,
        stream_id: StreamId,
        model_id: &ModelId,
        prompt: &str,
    ) -> EngineResult<StreamHandle>;

    /// Request termination of a stream. Idempotent.
    fn cancel(&self, handle: &StreamHandle) {
        handle.cancel();
    }
}

/// Producer side of a stream, held by the backend task.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<EngineResult<TokenEvent>>,
    cancel: CancellationToken,
}

impl StreamSender {
    /// Deliver one item. Returns `false` once the stream is cancelled or the
    /// consumer is gone; the producer should stop then.
    pub async fn send(&self, item: EngineResult<TokenEvent>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(item) => res.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the consumer cancels the stream.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Consumer side of a running token stream.
#[derive(Debug)]
pub struct StreamHandle {
    stream_id: StreamId,
    model_id: ModelId,
    events: mpsc::Receiver<EngineResult<TokenEvent>>,
    cancel: CancellationToken,
    guard: SequenceGuard,
}

impl StreamHandle {
    /// Create a connected sender/handle pair with a bounded buffer.
    pub fn channel(
        stream_id: StreamId,
        model_id: ModelId,
        buffer: usize,
    ) -> (StreamSender, StreamHandle) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let sender = StreamSender {
            tx,
            cancel: cancel.clone(),
        };
        let handle = StreamHandle {
            stream_id,
            model_id,
            events: rx,
            cancel,
            guard: SequenceGuard::new(),
        };
        (sender, handle)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Next event, `None` when the stream ended or was cancelled.
    ///
    /// Events that break per-stream ordering come back as
    /// `InvalidTokenEvent`; the stream itself stays usable.
    pub async fn next(&mut self) -> Option<EngineResult<TokenEvent>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            item = self.events.recv() => item?,
        };
        // A cancel that raced the receive still wins.
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(item.and_then(|event| {
            self.guard.admit(&event)?;
            Ok(event)
        }))
    }

    /// Stop the stream. No event is yielded after this returns.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(stream_id = %self.stream_id, model = %self.model_id, "Stream cancelled");
        }
        self.cancel.cancel();
        // Dropping buffered events is implied: `next()` checks the token first.
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token shared with the producer task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run the backend health check, bounded by `timeout`.
pub async fn check_health(source: &dyn TokenSource, timeout: Duration) -> EngineResult<()> {
    match tokio::time::timeout(timeout, source.health_check()).await {
        Ok(res) => res,
        Err(_) => Err(EngineError::BackendUnavailable(format!(
            "{}: health check timed out after {}ms",
            source.name(),
            timeout.as_millis()
        ))),
    }
}
