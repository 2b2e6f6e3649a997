//! Engine statistics for the `get-stats` control call.
//!
//! One [`EngineStats`] is created by the engine and handed by `Arc` to the
//! pool, every orchestrator run and the composer. Counters are atomics;
//! stream liveness and frame timings sit behind short-lived mutexes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ModelId, RunId, StreamId};

/// Where one stream is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Starting,
    Streaming,
    Finished,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

/// Liveness record for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamLiveness {
    pub run_id: RunId,
    pub stream_id: StreamId,
    pub model_id: ModelId,
    pub state: StreamState,
    pub tokens: u64,
    pub last_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Recent frame composition times in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub samples: usize,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
}

/// Sliding window of frame timings.
#[derive(Debug)]
struct FrameTimings {
    window: VecDeque<u64>,
    capacity: usize,
}

impl FrameTimings {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, us: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(us);
    }

    fn summary(&self) -> TimingSummary {
        if self.window.is_empty() {
            return TimingSummary::default();
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        TimingSummary {
            samples: sorted.len(),
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
            max_us: sorted[sorted.len() - 1],
            mean_us: sum / sorted.len() as u64,
        }
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let p = p.clamp(0.0, 1.0);
    let idx = ((sorted.len() as f64 * p).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[idx]
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub degraded: bool,
    pub frames_emitted: u64,
    pub frame_overruns: u64,
    pub dropped_inputs: u64,
    pub invalid_events: u64,
    /// Tokens that reached the merge loop after their window had closed.
    #[serde(default)]
    pub late_tokens: u64,
    pub streams: Vec<StreamLiveness>,
    pub frame_timing: TimingSummary,
}

impl StatsSnapshot {
    pub fn live_streams(&self) -> usize {
        self.streams.iter().filter(|s| s.state.is_alive()).count()
    }
}

pub type SharedStats = Arc<EngineStats>;

/// Shared statistics aggregator.
#[derive(Debug)]
pub struct EngineStats {
    queue_depth: AtomicUsize,
    degraded: AtomicBool,
    frames_emitted: AtomicU64,
    frame_overruns: AtomicU64,
    dropped_inputs: AtomicU64,
    invalid_events: AtomicU64,
    late_tokens: AtomicU64,
    streams: Mutex<BTreeMap<(RunId, StreamId), StreamLiveness>>,
    /// Most recently finished run; its records are kept for inspection.
    last_retired: Mutex<Option<RunId>>,
    timings: Mutex<FrameTimings>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Stats are advisory; a panic elsewhere must not take them down.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EngineStats {
    pub fn new(timing_window: usize) -> Self {
        Self {
            queue_depth: AtomicUsize::new(0),
            degraded: AtomicBool::new(false),
            frames_emitted: AtomicU64::new(0),
            frame_overruns: AtomicU64::new(0),
            dropped_inputs: AtomicU64::new(0),
            invalid_events: AtomicU64::new(0),
            late_tokens: AtomicU64::new(0),
            streams: Mutex::new(BTreeMap::new()),
            last_retired: Mutex::new(None),
            timings: Mutex::new(FrameTimings::new(timing_window)),
        }
    }

    pub fn shared(self) -> SharedStats {
        Arc::new(self)
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn record_frame(&self, elapsed: Duration, overrun: bool) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
        if overrun {
            self.frame_overruns.fetch_add(1, Ordering::Relaxed);
        }
        lock(&self.timings).record(elapsed.as_micros().min(u64::MAX as u128) as u64);
    }

    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.dropped_inputs.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_invalid_event(&self) {
        self.invalid_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_token(&self) {
        self.late_tokens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_started(&self, run_id: RunId, stream_id: StreamId, model_id: &ModelId) {
        lock(&self.streams).insert(
            (run_id, stream_id),
            StreamLiveness {
                run_id,
                stream_id,
                model_id: model_id.clone(),
                state: StreamState::Starting,
                tokens: 0,
                last_energy: None,
                last_error: None,
            },
        );
    }

    pub fn stream_token(&self, run_id: RunId, stream_id: StreamId, smoothed: f64) {
        if let Some(entry) = lock(&self.streams).get_mut(&(run_id, stream_id)) {
            entry.state = StreamState::Streaming;
            entry.tokens += 1;
            entry.last_energy = Some(smoothed);
        }
    }

    pub fn stream_ended(
        &self,
        run_id: RunId,
        stream_id: StreamId,
        state: StreamState,
        error: Option<String>,
    ) {
        if let Some(entry) = lock(&self.streams).get_mut(&(run_id, stream_id)) {
            // First terminal state wins.
            if entry.state.is_alive() {
                entry.state = state;
                entry.last_error = error;
            }
        }
    }

    /// Mark `run_id` finished. Its records stay until another run retires,
    /// so `get-stats` shows the last run but never accumulates history.
    pub fn retire_run(&self, run_id: RunId) {
        let mut streams = lock(&self.streams);
        let previous = lock(&self.last_retired).replace(run_id);
        if let Some(previous) = previous.filter(|p| *p != run_id) {
            streams.retain(|(run, _), _| *run != previous);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frame_overruns: self.frame_overruns.load(Ordering::Relaxed),
            dropped_inputs: self.dropped_inputs.load(Ordering::Relaxed),
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            late_tokens: self.late_tokens.load(Ordering::Relaxed),
            streams: lock(&self.streams).values().cloned().collect(),
            frame_timing: lock(&self.timings).summary(),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new(600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let stats = EngineStats::new(100);
        for us in 1..=100u64 {
            stats.record_frame(Duration::from_micros(us), us > 95);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.frames_emitted, 100);
        assert_eq!(snap.frame_overruns, 5);
        assert_eq!(snap.frame_timing.samples, 100);
        assert_eq!(snap.frame_timing.p50_us, 50);
        assert_eq!(snap.frame_timing.p95_us, 95);
        assert_eq!(snap.frame_timing.p99_us, 99);
        assert_eq!(snap.frame_timing.max_us, 100);
    }

    #[test]
    fn test_timing_window_evicts_oldest() {
        let stats = EngineStats::new(3);
        for us in [1000, 1, 2, 3] {
            stats.record_frame(Duration::from_micros(us), false);
        }
        let t = stats.snapshot().frame_timing;
        assert_eq!(t.samples, 3);
        assert_eq!(t.max_us, 3);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = EngineStats::default().snapshot();
        assert_eq!(snap.frame_timing, TimingSummary::default());
        assert!(snap.streams.is_empty());
        assert!(!snap.degraded);
    }

    #[test]
    fn test_stream_liveness_lifecycle() {
        let stats = EngineStats::default();
        let model = ModelId::new("m");
        stats.stream_started(RunId(1), StreamId(0), &model);
        stats.stream_started(RunId(1), StreamId(1), &model);
        stats.stream_token(RunId(1), StreamId(0), 0.7);
        stats.stream_ended(RunId(1), StreamId(1), StreamState::Failed, Some("timeout".into()));
        // Later terminal states do not overwrite the first.
        stats.stream_ended(RunId(1), StreamId(1), StreamState::Cancelled, None);

        let snap = stats.snapshot();
        assert_eq!(snap.live_streams(), 1);
        assert_eq!(snap.streams[0].tokens, 1);
        assert_eq!(snap.streams[0].last_energy, Some(0.7));
        assert_eq!(snap.streams[1].state, StreamState::Failed);
        assert_eq!(snap.streams[1].last_error.as_deref(), Some("timeout"));

    }

    #[test]
    fn test_only_the_last_retired_run_is_kept() {
        let stats = EngineStats::default();
        let model = ModelId::new("m");
        for run in 1..=3 {
            stats.stream_started(RunId(run), StreamId(run), &model);
            stats.stream_ended(RunId(run), StreamId(run), StreamState::Finished, None);
        }
        // Run 4 is still going.
        stats.stream_started(RunId(4), StreamId(4), &model);

        stats.retire_run(RunId(1));
        stats.retire_run(RunId(2));
        stats.retire_run(RunId(2));
        stats.retire_run(RunId(3));

        let runs: Vec<RunId> = stats.snapshot().streams.iter().map(|s| s.run_id).collect();
        assert_eq!(runs, vec![RunId(3), RunId(4)]);
    }
}
