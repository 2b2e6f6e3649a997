//! Fixed-rate frame composer.
//!
//! One tick every `frame_budget_ms`. Each tick drains the intake queue,
//! reduces what it found into exactly one [`Frame`] and hands it to the
//! [`FrameSink`]. The clock never waits on composition: missed ticks fire
//! back to back (`MissedTickBehavior::Burst`) so frame numbers stay gapless.
//!
//! ## Degraded mode
//!
//! ```text
//!   depth >= high_water ───────────────▶ degraded
//!   compose time > degrade_threshold ──▶ degraded
//!   degraded && depth <= low_water for recovery_ticks ticks ──▶ normal
//! ```
//!
//! Degraded ticks coalesce all pending inputs into one averaged value and
//! skip pattern events and the per-stream breakdown.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ComposerConfig, TierPolicy};
use crate::ensemble::SampleSink;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, SharedEventBus};
use crate::stats::SharedStats;
use crate::types::{
    ComposerInput, EnergySummary, EnsembleSample, Frame, InterferencePattern, PatternEvent,
    StreamEnergy, StreamId,
};

pub type SharedIntake = Arc<IntakeQueue>;

/// Bounded intake between ensemble runs and the composer.
///
/// Pushing never blocks: when full, the oldest input is discarded.
#[derive(Debug)]
pub struct IntakeQueue {
    inner: Mutex<VecDeque<ComposerInput>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl IntakeQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn shared(self) -> SharedIntake {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ComposerInput>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `input`. Returns `false` if an older input was dropped.
    pub fn push(&self, input: ComposerInput) -> bool {
        let mut queue = self.lock();
        let mut kept = true;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            kept = false;
        }
        queue.push_back(input);
        kept
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn drain(&self) -> Vec<ComposerInput> {
        self.lock().drain(..).collect()
    }

    /// Discard everything queued; returns how many inputs were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Inputs dropped since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

impl SampleSink for IntakeQueue {
    fn push_sample(&self, sample: EnsembleSample) {
        self.push(ComposerInput::Sample(sample));
    }
}

/// Transport boundary for composed frames. Must not block.
pub trait FrameSink: Send {
    /// Take ownership of `frame`. An error stops the composer.
    fn deliver(&mut self, frame: Frame) -> EngineResult<()>;
}

impl FrameSink for mpsc::Sender<Frame> {
    fn deliver(&mut self, frame: Frame) -> EngineResult<()> {
        match self.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                // Slow transport loses frames, the clock keeps going.
                debug!(frame = frame.frame_number, "Frame sink full, frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EngineError::Cancelled("frame receiver closed".into()))
            }
        }
    }
}

impl FrameSink for mpsc::UnboundedSender<Frame> {
    fn deliver(&mut self, frame: Frame) -> EngineResult<()> {
        self.send(frame)
            .map_err(|_| EngineError::Cancelled("frame receiver closed".into()))
    }
}

/// Totals for one composer lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposerReport {
    pub frames: u64,
    pub overruns: u64,
    /// Inputs discarded by the stop drain.
    pub drained_on_stop: usize,
}

pub struct FrameComposer {
    tier: TierPolicy,
    config: ComposerConfig,
    intake: SharedIntake,
    stats: SharedStats,
    bus: SharedEventBus,
    next_frame: u64,
    degraded_mode: bool,
    calm_ticks: u32,
    held: EnergySummary,
    overruns: u64,
}

impl FrameComposer {
    pub fn new(
        tier: TierPolicy,
        config: ComposerConfig,
        intake: SharedIntake,
        stats: SharedStats,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            tier,
            config,
            intake,
            stats,
            bus,
            next_frame: 0,
            degraded_mode: false,
            calm_ticks: 0,
            held: EnergySummary::default(),
            overruns: 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_mode
    }

    fn set_degraded(&mut self, degraded: bool, depth: usize, why: &str) {
        if self.degraded_mode == degraded {
            return;
        }
        self.degraded_mode = degraded;
        self.calm_ticks = 0;
        self.stats.set_degraded(degraded);
        if degraded {
            info!(frame = self.next_frame, queue_depth = depth, "Entering degraded mode: {}", why);
        } else {
            info!(frame = self.next_frame, queue_depth = depth, "Leaving degraded mode: {}", why);
        }
        self.bus.publish(EngineEvent::DegradedModeChanged {
            degraded,
            queue_depth: depth,
            frame_number: self.next_frame,
            timestamp: Utc::now(),
        });
    }

    /// Queue-depth hysteresis, evaluated once per tick.
    fn update_mode(&mut self, depth: usize) {
        if !self.degraded_mode {
            if depth >= self.config.high_water {
                self.set_degraded(true, depth, "queue above high-water mark");
            }
            return;
        }
        if depth <= self.config.low_water {
            self.calm_ticks += 1;
            if self.calm_ticks >= self.config.recovery_ticks {
                self.set_degraded(false, depth, "queue calm");
            }
        } else {
            self.calm_ticks = 0;
        }
    }

    /// Compose and account the frame for one tick.
    pub fn compose_tick(&mut self) -> Frame {
        let started = std::time::Instant::now();
        let mut frame = self.compose(started);
        if self.account(frame.frame_number, started.elapsed()) {
            frame.degraded = true;
        }
        frame
    }

    fn compose(&mut self, started: std::time::Instant) -> Frame {
        let depth = self.intake.len();
        self.stats.set_queue_depth(depth);
        self.update_mode(depth);

        let inputs = self.intake.drain();
        self.stats.record_dropped(self.intake.take_dropped());

        let frame_number = self.next_frame;
        self.next_frame += 1;

        let mut pattern_events = Vec::new();
        let mut partial = false;
        let summary = if inputs.is_empty() {
            EnergySummary {
                sample_count: 0,
                ..self.held.clone()
            }
        } else if self.degraded_mode {
            coalesce(&self.held, &inputs)
        } else {
            let deadline = started + self.tier.degrade_threshold();
            let (summary, cut) = self.process(&inputs, &mut pattern_events, deadline);
            partial = cut;
            summary
        };
        self.held = EnergySummary {
            per_stream: if self.degraded_mode {
                None
            } else {
                summary.per_stream.clone()
            },
            ..summary.clone()
        };

        let shortfall =
            summary.requested_streams > 0 && summary.active_streams < summary.requested_streams;
        Frame {
            frame_number,
            composed_at: Utc::now(),
            energy_summary: summary,
            pattern_events,
            degraded: self.degraded_mode || partial || shortfall,
        }
    }

    /// Handle every input individually until `deadline`, then coalesce the
    /// remainder. Returns the summary and whether the cut-over happened.
    fn process(
        &self,
        inputs: &[ComposerInput],
        pattern_events: &mut Vec<PatternEvent>,
        deadline: std::time::Instant,
    ) -> (EnergySummary, bool) {
        let mut summary = EnergySummary {
            sample_count: inputs.len(),
            per_stream: None,
            ..self.held.clone()
        };
        let mut streams: BTreeMap<StreamId, StreamEnergy> = BTreeMap::new();
        let mut saw_sample = false;
        let mut energies: Vec<f64> = Vec::new();

        for (i, input) in inputs.iter().enumerate() {
            if std::time::Instant::now() > deadline {
                let rest = coalesce(&summary, &inputs[i..]);
                warn!(
                    processed = i,
                    remaining = inputs.len() - i,
                    "Frame deadline reached, coalescing remaining inputs"
                );
                return (
                    EnergySummary {
                        sample_count: inputs.len(),
                        per_stream: None,
                        ..rest
                    },
                    true,
                );
            }
            match input {
                ComposerInput::Sample(sample) => {
                    saw_sample = true;
                    for (id, v) in &sample.member_values {
                        streams.insert(
                            *id,
                            StreamEnergy {
                                stream_id: *id,
                                instant: v.instant,
                                smoothed: v.smoothed,
                            },
                        );
                    }
                    summary.ensemble_energy = sample.ensemble_energy;
                    summary.diversity_index = sample.diversity_index;
                    summary.pattern = sample.pattern;
                    summary.active_streams = sample.active_streams;
                    summary.requested_streams = sample.requested_streams;
                    if sample.pattern != InterferencePattern::Neutral {
                        pattern_events.push(PatternEvent {
                            pattern: sample.pattern,
                            ensemble_energy: sample.ensemble_energy,
                            diversity_index: sample.diversity_index,
                            member_count: sample.member_values.len(),
                        });
                    }
                }
                ComposerInput::Energy(v) => {
                    energies.push(v.smoothed);
                    streams.insert(
                        v.stream_id,
                        StreamEnergy {
                            stream_id: v.stream_id,
                            instant: v.instant,
                            smoothed: v.smoothed,
                        },
                    );
                }
            }
        }

        if !saw_sample && !energies.is_empty() {
            summary.ensemble_energy = energies.iter().sum::<f64>() / energies.len() as f64;
        }
        if self.config.per_stream_breakdown {
            summary.per_stream = Some(streams.into_values().collect());
        }
        (summary, false)
    }

    /// Record timing; returns `true` on overrun.
    pub fn account(&mut self, frame_number: u64, elapsed: Duration) -> bool {
        let budget = self.tier.frame_budget();
        let overrun = elapsed > budget;
        self.stats.record_frame(elapsed, overrun);

        if overrun {
            self.overruns += 1;
            let err = EngineError::FrameOverrun {
                frame_number,
                elapsed_us: elapsed.as_micros() as u64,
                budget_us: budget.as_micros() as u64,
            };
            warn!(overruns = self.overruns, "{}", err);
            self.bus.publish(EngineEvent::FrameOverrun {
                frame_number,
                elapsed_us: elapsed.as_micros() as u64,
                budget_us: budget.as_micros() as u64,
                timestamp: Utc::now(),
            });
        }
        if elapsed > self.tier.degrade_threshold() {
            let depth = self.intake.len();
            self.set_degraded(true, depth, "tick over threshold");
            // A slow tick restarts the calm count.
            self.calm_ticks = 0;
        }
        overrun
    }

    /// Drive the clock until `stop` fires or the sink fails.
    ///
    /// On stop: upstream runs are cancelled, the queue is drained and no
    /// further frame is delivered.
    pub async fn run<S: FrameSink>(
        mut self,
        mut sink: S,
        stop: CancellationToken,
        upstream: CancellationToken,
    ) -> ComposerReport {
        let mut ticker = interval(self.tier.frame_budget());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut frames = 0u64;
        info!(budget_ms = self.tier.frame_budget_ms, "Frame composer started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = std::time::Instant::now();
            let frame = self.compose(started);
            if stop.is_cancelled() {
                break;
            }
            let frame_number = frame.frame_number;
            if let Err(e) = sink.deliver(frame) {
                warn!("Frame sink failed, stopping composer: {}", e);
                break;
            }
            frames += 1;
            // Delivery counts against the tick budget too.
            self.account(frame_number, started.elapsed());
        }

        upstream.cancel();
        let drained_on_stop = self.intake.clear();
        self.stats.set_queue_depth(0);
        info!(frames, overruns = self.overruns, drained_on_stop, "Frame composer stopped");
        ComposerReport {
            frames,
            overruns: self.overruns,
            drained_on_stop,
        }
    }
}

/// Collapse `inputs` into one approximate summary (simple average).
fn coalesce(held: &EnergySummary, inputs: &[ComposerInput]) -> EnergySummary {
    let mut out = EnergySummary {
        sample_count: inputs.len(),
        per_stream: None,
        ..held.clone()
    };
    let mut sample_energy = Vec::new();
    let mut stream_energy = Vec::new();
    for input in inputs {
        match input {
            ComposerInput::Sample(s) => {
                sample_energy.push(s.ensemble_energy);
                out.diversity_index = s.diversity_index;
                out.pattern = s.pattern;
                out.active_streams = s.active_streams;
                out.requested_streams = s.requested_streams;
            }
            ComposerInput::Energy(v) => stream_energy.push(v.smoothed),
        }
    }
    let pick = if sample_energy.is_empty() {
        &stream_energy
    } else {
        &sample_energy
    };
    if !pick.is_empty() {
        out.ensemble_energy = pick.iter().sum::<f64>() / pick.len() as f64;
    }
    out
}
