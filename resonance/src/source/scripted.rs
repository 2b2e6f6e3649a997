//! In-process scripted backend.
//!
//! Replays a fixed token script per model on tokio's clock. Used by the
//! integration tests (with a paused clock) and by the runner's demo mode.
//! Failure injection covers every error path the orchestrator handles:
//! unhealthy backend, transient start failures, load failures, mid-stream
//! errors and silent hangs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ModelFootprint, StreamHandle, StreamSender, TokenSource};
use crate::error::{EngineError, EngineResult};
use crate::types::{ModelId, StreamId, TokenAlternative, TokenEvent};

/// One scripted token.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    /// Wait before emitting, also reported as the inter-token delay.
    pub delay_ms: u64,
    pub text: String,
    pub certainty: Option<f64>,
    pub alternatives: Vec<TokenAlternative>,
}

/// How a script ends after its last step.
#[derive(Debug, Clone)]
pub enum ScriptEnd {
    /// Emit a terminal marker.
    Finish,
    /// Surface an error to the consumer.
    Fail(EngineError),
    /// Go silent until cancelled.
    Hang,
}

/// Token script for one model.
#[derive(Debug, Clone)]
pub struct Script {
    steps: Vec<ScriptStep>,
    end: ScriptEnd,
}

impl Script {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            end: ScriptEnd::Finish,
        }
    }

    pub fn token(mut self, delay_ms: u64, text: &str, certainty: Option<f64>) -> Self {
        self.steps.push(ScriptStep {
            delay_ms,
            text: text.to_string(),
            certainty,
            alternatives: Vec::new(),
        });
        self
    }

    /// Append `count` identical tokens.
    pub fn repeat(mut self, count: usize, delay_ms: u64, text: &str, certainty: Option<f64>) -> Self {
        for _ in 0..count {
            self = self.token(delay_ms, text, certainty);
        }
        self
    }

    /// Attach top-k alternatives to the most recent step.
    pub fn with_alternatives(mut self, alternatives: Vec<TokenAlternative>) -> Self {
        if let Some(last) = self.steps.last_mut() {
            last.alternatives = alternatives;
        }
        self
    }

    pub fn then_fail(mut self, err: EngineError) -> Self {
        self.end = ScriptEnd::Fail(err);
        self
    }

    pub fn then_hang(mut self) -> Self {
        self.end = ScriptEnd::Hang;
        self
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    /// A steady stream with gently varying cadence and certainty, seeded by
    /// `phase` so different models do not move in lockstep.
    pub fn wave(count: usize, base_delay_ms: u64, phase: f64) -> Self {
        let mut script = Self::new();
        for i in 0..count {
            let t = i as f64 * 0.15 + phase;
            let delay = (base_delay_ms as f64 * (1.0 + 0.6 * t.sin())).max(1.0) as u64;
            let certainty = (0.65 + 0.3 * (t * 0.7).cos()).clamp(0.0, 1.0);
            let text = if (t * 0.5).sin() > 0.0 { "tok" } else { "alt" };
            script = script.token(delay, text, Some(certainty));
        }
        script
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic backend driven by per-model scripts.
pub struct ScriptedSource {
    scripts: Mutex<HashMap<ModelId, Script>>,
    load_failures: Mutex<HashSet<ModelId>>,
    stalled_loads: Mutex<HashSet<ModelId>>,
    stalled_starts: Mutex<HashSet<ModelId>>,
    healthy: AtomicBool,
    failing_starts: AtomicU32,
    buffer: usize,
    memory_estimate: u64,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    starts: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            load_failures: Mutex::new(HashSet::new()),
            stalled_loads: Mutex::new(HashSet::new()),
            stalled_starts: Mutex::new(HashSet::new()),
            healthy: AtomicBool::new(true),
            failing_starts: AtomicU32::new(0),
            buffer: 64,
            memory_estimate: 512 * 1024 * 1024,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }

    /// Register (or replace) the script for `model_id`.
    pub fn with_script(self, model_id: impl Into<ModelId>, script: Script) -> Self {
        self.set_script(model_id, script);
        self
    }

    pub fn set_script(&self, model_id: impl Into<ModelId>, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(model_id.into(), script);
        }
    }

    /// Make `load_model` fail for `model_id`.
    pub fn fail_loading(self, model_id: impl Into<ModelId>) -> Self {
        if let Ok(mut failures) = self.load_failures.lock() {
            failures.insert(model_id.into());
        }
        self
    }

    /// `load_model` for `model_id` never completes.
    pub fn stall_loading(self, model_id: impl Into<ModelId>) -> Self {
        if let Ok(mut stalled) = self.stalled_loads.lock() {
            stalled.insert(model_id.into());
        }
        self
    }

    /// `start` for `model_id` accepts the request and never answers.
    pub fn stall_starts(self, model_id: impl Into<ModelId>) -> Self {
        if let Ok(mut stalled) = self.stalled_starts.lock() {
            stalled.insert(model_id.into());
        }
        self
    }

    /// Capacity of each stream's event buffer.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The next `n` calls to `start` report `BackendUnavailable`.
    pub fn fail_next_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn is_stalled(set: &Mutex<HashSet<ModelId>>, model_id: &ModelId) -> bool {
        set.lock().map(|s| s.contains(model_id)).unwrap_or(false)
    }

    fn script_for(&self, model_id: &ModelId) -> Option<Script> {
        self.scripts
            .lock()
            .ok()
            .and_then(|scripts| scripts.get(model_id).cloned())
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> EngineResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::BackendUnavailable(
                "scripted backend marked unhealthy".into(),
            ))
        }
    }

    async fn load_model(&self, model_id: &ModelId) -> EngineResult<ModelFootprint> {
        self.health_check().await?;
        let refused = self
            .load_failures
            .lock()
            .map(|f| f.contains(model_id))
            .unwrap_or(false);
        if refused {
            return Err(EngineError::load_failed(model_id, "injected load failure"));
        }
        if Self::is_stalled(&self.stalled_loads, model_id) {
            return std::future::pending().await;
        }
        if self.script_for(model_id).is_none() {
            return Err(EngineError::load_failed(model_id, "no script registered"));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ModelFootprint {
            memory_estimate: self.memory_estimate,
        })
    }

    async fn unload_model(&self, _model_id: &ModelId) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }

    async fn start(
        &self,
        stream_id: StreamId,
        model_id: &ModelId,
        _prompt: &str,
    ) -> EngineResult<StreamHandle> {
        let pending = self.failing_starts.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_starts.store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::BackendUnavailable(format!(
                "injected start failure ({} left)",
                pending - 1
            )));
        }
        if Self::is_stalled(&self.stalled_starts, model_id) {
            return std::future::pending().await;
        }
        let script = self
            .script_for(model_id)
            .ok_or_else(|| EngineError::load_failed(model_id, "no script registered"))?;

        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, handle) = StreamHandle::channel(stream_id, model_id.clone(), self.buffer);
        tokio::spawn(play(stream_id, script, tx));
        Ok(handle)
    }
}

async fn play(stream_id: StreamId, script: Script, tx: StreamSender) {
    let mut seq: u64 = 0;
    for step in script.steps {
        tokio::select! {
            biased;
            _ = tx.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(step.delay_ms)) => {}
        }
        let mut builder = TokenEvent::builder(stream_id, seq)
            .with_delay_ms(step.delay_ms as f64)
            .with_text(step.text)
            .with_alternatives(step.alternatives);
        if let Some(c) = step.certainty {
            builder = builder.with_certainty(c);
        }
        if !tx.send(builder.build()).await {
            return;
        }
        seq += 1;
    }

    match script.end {
        ScriptEnd::Finish => {
            let terminator = TokenEvent::builder(stream_id, seq).finished().build();
            tx.send(terminator).await;
        }
        ScriptEnd::Fail(err) => {
            debug!(%stream_id, "Scripted stream failing: {}", err);
            tx.send(Err(err)).await;
        }
        ScriptEnd::Hang => tx.cancelled().await,
    }
}
