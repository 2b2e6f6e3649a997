//! Ensemble run: concurrent producers, one merge loop.
//!
//! ```text
//!  producer(s0) ─┐
//!  producer(s1) ─┼─▶ mpsc (bounded) ─▶ merge loop ─▶ SampleSink
//!  producer(s2) ─┘                        │
//!                                   window clock
//! ```
//!
//! Each producer owns its stream handle and its [`EnergyMapper`]. The merge
//! loop waits on "next message, window deadline or cancel", so a stalled
//! stream never holds a window open. Stream failures stay inside their
//! producer; the run carries on with whoever is left.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scoring::{score_window, TokenObservation, WindowMember};
use super::state::{RunState, RunStateMachine, TransitionRecord};
use super::SampleSink;
use crate::config::EngineConfig;
use crate::energy::EnergyMapper;
use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::events::{EngineEvent, SharedEventBus};
use crate::pool::{ModelHandle, ModelPool};
use crate::source::{check_health, start_with_retry, TokenSource};
use crate::stats::{SharedStats, StreamState};
use crate::types::{EnsembleSample, ModelId, RunId, StreamId};

/// What a producer tells the merge loop.
#[derive(Debug)]
enum StreamMessage {
    Token(TokenObservation),
    Finished { tokens: u64 },
    Cancelled,
    Failed(EngineError),
}

#[derive(Debug)]
struct Envelope {
    stream_id: StreamId,
    message: StreamMessage,
}

/// How one stream ended.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub stream_id: StreamId,
    pub model_id: ModelId,
    pub state: StreamState,
    pub tokens: u64,
    pub error: Option<String>,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub final_state: RunState,
    /// Streams the run tried to start (after tier truncation).
    pub requested_streams: usize,
    /// Models cut by `max_parallel_models`.
    pub truncated: Vec<ModelId>,
    /// Models that never produced a stream.
    pub load_failures: Vec<(ModelId, String)>,
    pub streams: Vec<StreamOutcome>,
    pub samples_emitted: u64,
    pub transitions: Vec<TransitionRecord>,
}

impl RunReport {
    pub fn started_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Everything a producer needs, cloned per stream.
#[derive(Clone)]
struct ProducerContext {
    run_id: RunId,
    config: Arc<EngineConfig>,
    source: Arc<dyn TokenSource>,
    stats: SharedStats,
    prompt: Arc<str>,
}

struct LiveStream {
    model_id: ModelId,
    weight: f64,
    tokens: u64,
}

pub struct EnsembleOrchestrator {
    config: Arc<EngineConfig>,
    source: Arc<dyn TokenSource>,
    pool: Arc<ModelPool>,
    stats: SharedStats,
    bus: SharedEventBus,
    next_run: AtomicU64,
    next_stream: AtomicU64,
}

impl EnsembleOrchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        source: Arc<dyn TokenSource>,
        pool: Arc<ModelPool>,
        stats: SharedStats,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            config,
            source,
            pool,
            stats,
            bus,
            next_run: AtomicU64::new(1),
            next_stream: AtomicU64::new(0),
        }
    }

    pub fn allocate_run_id(&self) -> RunId {
        RunId(self.next_run.fetch_add(1, Ordering::Relaxed))
    }

    fn transition(&self, sm: &mut RunStateMachine, run_id: RunId, to: RunState, reason: &str) {
        let from = sm.current();
        match sm.advance(to, Some(reason)) {
            Ok(()) => self.bus.publish(EngineEvent::RunStateChanged {
                run_id,
                from,
                to,
                timestamp: Utc::now(),
            }),
            Err(e) => error!(%run_id, "{}", e),
        }
    }

    /// Run one ensemble to completion.
    ///
    /// Returns `Ok` for every non-fatal ending, including `Aborted` runs.
    /// `EnsembleFailed` is returned only when no stream is left and the
    /// backend health check fails too.
    pub async fn run(
        &self,
        run_id: RunId,
        model_ids: &[ModelId],
        prompt: &str,
        sink: Arc<dyn SampleSink>,
        cancel: CancellationToken,
    ) -> EngineResult<RunReport> {
        let mut sm = RunStateMachine::new(run_id);
        info!(%run_id, requested = model_ids.len(), "Starting ensemble run");

        let acquisition = self.pool.acquire_for_ensemble(model_ids).await;
        let requested_streams = acquisition.handles.len() + acquisition.failures.len();
        let load_failures: Vec<(ModelId, String)> = acquisition
            .failures
            .iter()
            .map(|(m, e)| {
                warn!(%run_id, model = %m, "Model unavailable for run: {}", e);
                (m.clone(), e.to_string())
            })
            .collect();
        let mut report = RunReport {
            run_id,
            final_state: RunState::Starting,
            requested_streams,
            truncated: acquisition.truncated,
            load_failures,
            streams: Vec::new(),
            samples_emitted: 0,
            transitions: Vec::new(),
        };
        let handles = acquisition.handles;

        if handles.is_empty() || cancel.is_cancelled() {
            self.release_all(&handles).await;
            let reason = if cancel.is_cancelled() {
                "cancelled before streaming"
            } else {
                "no model could be acquired"
            };
            let fatal = if cancel.is_cancelled() {
                None
            } else {
                self.fatal_if_unreachable(run_id).await
            };
            self.transition(&mut sm, run_id, RunState::Aborted, reason);
            report.final_state = sm.current();
            report.transitions = sm.into_transitions();
            return match fatal {
                Some(err) => Err(err),
                None => Ok(report),
            };
        }

        // Launch producers.
        let capacity = self.config.ensemble.channel_capacity;
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
        let ctx = ProducerContext {
            run_id,
            config: self.config.clone(),
            source: self.source.clone(),
            stats: self.stats.clone(),
            prompt: Arc::from(prompt),
        };
        let mut tasks = JoinSet::new();
        let mut live: BTreeMap<StreamId, LiveStream> = BTreeMap::new();
        for handle in &handles {
            let stream_id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
            self.stats.stream_started(run_id, stream_id, &handle.model_id);
            live.insert(
                stream_id,
                LiveStream {
                    model_id: handle.model_id.clone(),
                    weight: self.config.ensemble.weight_for(handle.model_id.as_str()),
                    tokens: 0,
                },
            );
            tasks.spawn(produce(
                ctx.clone(),
                stream_id,
                handle.model_id.clone(),
                tx.clone(),
                cancel.child_token(),
            ));
        }
        drop(tx);
        self.transition(&mut sm, run_id, RunState::Streaming, "streams launched");

        // Merge loop.
        let window = self.config.ensemble.window();
        let mut window_start = Instant::now();
        let mut window_end = window_start + window;
        let mut pending: BTreeMap<StreamId, WindowMember> = BTreeMap::new();
        let mut active: BTreeSet<StreamId> = live.keys().copied().collect();
        let mut last_active = active.len();
        let mut any_clean_end = false;
        let mut cancelled = false;

        // Empty windows are skipped unless the live set changed.
        let emit = |pending: &mut BTreeMap<StreamId, WindowMember>,
                    start: Instant,
                    end: Instant,
                    active: usize,
                    requested: usize,
                    last_active: &mut usize,
                    report: &mut RunReport| {
            if pending.is_empty() && active == *last_active {
                return;
            }
            let members = std::mem::take(pending);
            let score = score_window(&members, &self.config.ensemble);
            let sample = EnsembleSample {
                window_start: start,
                window_end: end,
                member_values: members
                    .iter()
                    .filter_map(|(id, m)| m.latest().map(|v| (*id, v)))
                    .collect(),
                ensemble_energy: score.ensemble_energy,
                diversity_index: score.diversity_index,
                pattern: score.pattern,
                active_streams: active,
                requested_streams: requested,
            };
            *last_active = active;
            report.samples_emitted += 1;
            sink.push_sample(sample);
        };

        while !active.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                msg = rx.recv() => {
                    let Some(Envelope { stream_id, message }) = msg else {
                        break;
                    };
                    match message {
                        StreamMessage::Token(obs) => {
                            while obs.value.timestamp >= window_end {
                                emit(&mut pending, window_start, window_end, active.len(), requested_streams, &mut last_active, &mut report);
                                window_start = window_end;
                                window_end += window;
                            }
                            if let Some(stream) = live.get_mut(&stream_id) {
                                if !place_token(&mut pending, stream, stream_id, obs, window_start) {
                                    debug!(%run_id, %stream_id, "Dropping token stamped before its window");
                                    self.stats.record_late_token();
                                }
                            }
                        }
                        StreamMessage::Finished { tokens } => {
                            active.remove(&stream_id);
                            any_clean_end = true;
                            self.stream_ended(&mut report, &live, stream_id, StreamState::Finished, tokens, None);
                        }
                        StreamMessage::Cancelled => {
                            active.remove(&stream_id);
                            any_clean_end = true;
                            let tokens = live.get(&stream_id).map_or(0, |s| s.tokens);
                            self.stream_ended(&mut report, &live, stream_id, StreamState::Cancelled, tokens, None);
                        }
                        StreamMessage::Failed(err) => {
                            active.remove(&stream_id);
                            let tokens = live.get(&stream_id).map_or(0, |s| s.tokens);
                            warn!(%run_id, %stream_id, remaining = active.len(), "Stream removed from ensemble: {}", err);
                            self.stream_ended(&mut report, &live, stream_id, StreamState::Failed, tokens, Some(err));
                        }
                    }
                }
                _ = sleep_until(window_end) => {
                    emit(&mut pending, window_start, window_end, active.len(), requested_streams, &mut last_active, &mut report);
                    window_start = window_end;
                    window_end += window;
                }
            }
        }

        let mut fatal = None;
        let now = Instant::now().max(window_start);
        if cancelled {
            emit(&mut pending, window_start, now, 0, requested_streams, &mut last_active, &mut report);
            self.transition(&mut sm, run_id, RunState::Aborted, "cancelled");
            tasks.shutdown().await;
            // Streams still running at cancel time.
            for stream_id in active.iter().copied().collect::<Vec<_>>() {
                let tokens = live.get(&stream_id).map_or(0, |s| s.tokens);
                self.stream_ended(&mut report, &live, stream_id, StreamState::Cancelled, tokens, None);
            }
        } else if any_clean_end {
            self.transition(&mut sm, run_id, RunState::Draining, "all streams ended");
            // Nothing is expected from a drained run, so the closing sample
            // reports zero requested streams rather than a shortfall.
            emit(&mut pending, window_start, now, 0, 0, &mut last_active, &mut report);
            self.transition(&mut sm, run_id, RunState::Completed, "drained");
            tasks.shutdown().await;
        } else {
            emit(&mut pending, window_start, now, 0, requested_streams, &mut last_active, &mut report);
            tasks.shutdown().await;
            fatal = self.fatal_if_unreachable(run_id).await;
            self.transition(&mut sm, run_id, RunState::Aborted, "no stream left alive");
        }

        self.release_all(&handles).await;
        report.final_state = sm.current();
        report.transitions = sm.into_transitions();
        info!(
            %run_id,
            state = %report.final_state,
            samples = report.samples_emitted,
            streams = report.streams.len(),
            "Ensemble run finished"
        );
        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn stream_ended(
        &self,
        report: &mut RunReport,
        live: &BTreeMap<StreamId, LiveStream>,
        stream_id: StreamId,
        state: StreamState,
        tokens: u64,
        error: Option<EngineError>,
    ) {
        let model_id = live
            .get(&stream_id)
            .map(|s| s.model_id.clone())
            .unwrap_or_else(|| ModelId::new("unknown"));
        let error_text = error.as_ref().map(|e| e.to_string());
        self.stats
            .stream_ended(report.run_id, stream_id, state, error_text.clone());

        match state {
            StreamState::Failed => self.bus.publish(EngineEvent::StreamFailed {
                run_id: report.run_id,
                stream_id,
                model_id: model_id.clone(),
                error: error_text.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            }),
            StreamState::Finished => self.bus.publish(EngineEvent::StreamFinished {
                run_id: report.run_id,
                stream_id,
                model_id: model_id.clone(),
                tokens,
                timestamp: Utc::now(),
            }),
            _ => {}
        }

        report.streams.push(StreamOutcome {
            stream_id,
            model_id,
            state,
            tokens,
            error: error_text,
        });
    }

    async fn release_all(&self, handles: &[ModelHandle]) {
        for handle in handles {
            self.pool.release(handle).await;
        }
    }

    /// `EnsembleFailed` if the backend cannot be reached, else `None`.
    async fn fatal_if_unreachable(&self, run_id: RunId) -> Option<EngineError> {
        let timeout = self.config.stream.health_check_timeout();
        match check_health(self.source.as_ref(), timeout).await {
            Ok(()) => None,
            Err(e) => {
                error!(%run_id, "All streams lost and backend unreachable: {}", e);
                Some(EngineError::EnsembleFailed(format!(
                    "{run_id}: all streams lost and backend unreachable ({e})"
                )))
            }
        }
    }
}

/// File `obs` under the open window. A token stamped before the window
/// opened still counts toward the stream but joins no window.
fn place_token(
    pending: &mut BTreeMap<StreamId, WindowMember>,
    stream: &mut LiveStream,
    stream_id: StreamId,
    obs: TokenObservation,
    window_start: Instant,
) -> bool {
    stream.tokens += 1;
    if obs.value.timestamp < window_start {
        return false;
    }
    pending
        .entry(stream_id)
        .or_insert_with(|| WindowMember::new(stream.weight))
        .observations
        .push(obs);
    true
}

/// Drive one stream: start it, map every token, report how it ended.
async fn produce(
    ctx: ProducerContext,
    stream_id: StreamId,
    model_id: ModelId,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    let send = |message: StreamMessage| {
        let tx = tx.clone();
        async move { tx.send(Envelope { stream_id, message }).await.is_ok() }
    };

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            send(StreamMessage::Cancelled).await;
            return;
        }
        res = start_with_retry(
            ctx.source.as_ref(),
            stream_id,
            &model_id,
            &ctx.prompt,
            &ctx.config.retry,
            ctx.config.stream.health_check_timeout(),
            ctx.config.stream.stream_timeout(),
        ) => res,
    };
    let mut handle = match started {
        Ok(h) => h,
        Err(e) => {
            warn!(run_id = %ctx.run_id, %stream_id, model = %model_id, "Stream failed to start: {}", e);
            send(StreamMessage::Failed(e)).await;
            return;
        }
    };
    debug!(run_id = %ctx.run_id, %stream_id, model = %model_id, "Stream started");

    let mut mapper = EnergyMapper::new(stream_id, ctx.config.energy.clone());
    let stream_timeout = ctx.config.stream.stream_timeout();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ctx.source.cancel(&handle);
                send(StreamMessage::Cancelled).await;
                return;
            }
            next = timeout(stream_timeout, handle.next()) => next,
        };

        match next {
            Err(_) => {
                ctx.source.cancel(&handle);
                let err = EngineError::StreamTimeout {
                    stream_id,
                    timeout_ms: stream_timeout.as_millis() as u64,
                };
                send(StreamMessage::Failed(err)).await;
                return;
            }
            Ok(None) => {
                // Producer closed without a terminal marker.
                debug!(%stream_id, "Stream closed without terminal marker");
                send(StreamMessage::Finished {
                    tokens: mapper.observed(),
                })
                .await;
                return;
            }
            Ok(Some(Err(e))) if e.category() == ErrorCategory::Dropped => {
                warn!(run_id = %ctx.run_id, %stream_id, "Dropping invalid token event: {}", e);
                ctx.stats.record_invalid_event();
            }
            Ok(Some(Err(e))) => {
                ctx.source.cancel(&handle);
                send(StreamMessage::Failed(e)).await;
                return;
            }
            Ok(Some(Ok(event))) => {
                if !event.is_bare_terminator() {
                    let value = mapper.observe(&event);
                    ctx.stats.stream_token(ctx.run_id, stream_id, value.smoothed);
                    let obs = TokenObservation {
                        value,
                        text: event.text().to_string(),
                        certainty: event.certainty(),
                        alternatives: event.alternatives().to_vec(),
                    };
                    if !send(StreamMessage::Token(obs)).await {
                        ctx.source.cancel(&handle);
                        return;
                    }
                }
                if event.is_final() {
                    send(StreamMessage::Finished {
                        tokens: mapper.observed(),
                    })
                    .await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnergyValue;
    use std::time::Duration;

    fn observation(stream_id: StreamId, at: Instant) -> TokenObservation {
        TokenObservation {
            value: EnergyValue::new(stream_id, 0.5, 0.5, at),
            text: "x".into(),
            certainty: Some(0.8),
            alternatives: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_older_than_window_is_kept_out() {
        let stream_id = StreamId(3);
        let mut stream = LiveStream {
            model_id: ModelId::new("m"),
            weight: 1.0,
            tokens: 0,
        };
        let mut pending = BTreeMap::new();
        let stamped = Instant::now();
        tokio::time::advance(Duration::from_millis(20)).await;
        let window_start = Instant::now();

        let late = observation(stream_id, stamped);
        assert!(!place_token(&mut pending, &mut stream, stream_id, late, window_start));
        assert!(pending.is_empty());

        let fresh = observation(stream_id, window_start);
        assert!(place_token(&mut pending, &mut stream, stream_id, fresh, window_start));
        assert_eq!(pending[&stream_id].observations.len(), 1);
        assert_eq!(stream.tokens, 2);
    }
}
