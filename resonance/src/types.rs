//! Core value types flowing through the engine.
//!
//! Data moves strictly upward:
//!
//! ```text
//! TokenSource ─▶ TokenEvent ─▶ EnergyMapper ─▶ EnergyValue
//!                                                  │
//!              EnsembleOrchestrator ◀──────────────┘
//!                     │ EnsembleSample
//!                     ▼
//!              FrameComposer ─▶ Frame ─▶ transport
//! ```
//!
//! Every type is validated when it is built, never when it is consumed.
//! Once constructed, events and samples are never mutated.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};

/// Identifier of one token stream within the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Identifier of one ensemble run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Backend model identifier, as understood by the TokenSource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── TokenEvent ───────────────────────────────────────────────────────────────

/// One candidate token from the backend's top-k distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAlternative {
    pub text: String,
    pub probability: f64,
}

/// One unit of generated output from a single backend stream.
///
/// Built only through [`TokenEventBuilder::build`], which rejects malformed
/// certainty and probability values. `inter_token_delay_ms` may be zero or
/// negative when the backend clock misbehaves; the mapper treats that as
/// maximal cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    stream_id: StreamId,
    sequence_number: u64,
    emitted_at: Instant,
    inter_token_delay_ms: f64,
    certainty: Option<f64>,
    text: String,
    alternatives: Vec<TokenAlternative>,
    is_final: bool,
}

impl TokenEvent {
    /// Start building an event for `stream_id` at `sequence_number`.
    pub fn builder(stream_id: StreamId, sequence_number: u64) -> TokenEventBuilder {
        TokenEventBuilder {
            stream_id,
            sequence_number,
            emitted_at: None,
            inter_token_delay_ms: 0.0,
            certainty: None,
            text: String::new(),
            alternatives: Vec::new(),
            is_final: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn emitted_at(&self) -> Instant {
        self.emitted_at
    }

    pub fn inter_token_delay_ms(&self) -> f64 {
        self.inter_token_delay_ms
    }

    /// Probability-derived confidence, absent when the backend gives no logits.
    pub fn certainty(&self) -> Option<f64> {
        self.certainty
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn alternatives(&self) -> &[TokenAlternative] {
        &self.alternatives
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// A terminal marker with no token payload (e.g. SSE `[DONE]`).
    pub fn is_bare_terminator(&self) -> bool {
        self.is_final && self.text.is_empty() && self.certainty.is_none()
    }
}

/// Builder for [`TokenEvent`].
#[derive(Debug, Clone)]
pub struct TokenEventBuilder {
    stream_id: StreamId,
    sequence_number: u64,
    emitted_at: Option<Instant>,
    inter_token_delay_ms: f64,
    certainty: Option<f64>,
    text: String,
    alternatives: Vec<TokenAlternative>,
    is_final: bool,
}

impl TokenEventBuilder {
    /// Monotonic emission time. Defaults to `Instant::now()` at build time.
    pub fn at(mut self, emitted_at: Instant) -> Self {
        self.emitted_at = Some(emitted_at);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: f64) -> Self {
        self.inter_token_delay_ms = delay_ms;
        self
    }

    pub fn with_certainty(mut self, certainty: f64) -> Self {
        self.certainty = Some(certainty);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_alternative(mut self, text: impl Into<String>, probability: f64) -> Self {
        self.alternatives.push(TokenAlternative {
            text: text.into(),
            probability,
        });
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<TokenAlternative>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn build(self) -> EngineResult<TokenEvent> {
        if self.inter_token_delay_ms.is_nan() {
            return Err(EngineError::invalid(format!(
                "{} seq {}: inter-token delay is NaN",
                self.stream_id, self.sequence_number
            )));
        }
        if let Some(c) = self.certainty {
            if !c.is_finite() || !(0.0..=1.0).contains(&c) {
                return Err(EngineError::invalid(format!(
                    "{} seq {}: certainty {c} outside [0,1]",
                    self.stream_id, self.sequence_number
                )));
            }
        }
        if let Some(alt) = self
            .alternatives
            .iter()
            .find(|a| !a.probability.is_finite() || !(0.0..=1.0).contains(&a.probability))
        {
            return Err(EngineError::invalid(format!(
                "{} seq {}: alternative '{}' has probability {}",
                self.stream_id, self.sequence_number, alt.text, alt.probability
            )));
        }

        Ok(TokenEvent {
            stream_id: self.stream_id,
            sequence_number: self.sequence_number,
            emitted_at: self.emitted_at.unwrap_or_else(Instant::now),
            inter_token_delay_ms: self.inter_token_delay_ms,
            certainty: self.certainty,
            text: self.text,
            alternatives: self.alternatives,
            is_final: self.is_final,
        })
    }
}

/// Per-stream ordering check: strictly increasing sequence numbers and
/// non-decreasing emission times.
#[derive(Debug, Default, Clone)]
pub struct SequenceGuard {
    last_sequence: Option<u64>,
    last_emitted_at: Option<Instant>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `event` if it respects stream ordering; otherwise leave the
    /// guard untouched and return `InvalidTokenEvent`.
    pub fn admit(&mut self, event: &TokenEvent) -> EngineResult<()> {
        if let Some(prev) = self.last_sequence {
            if event.sequence_number() <= prev {
                return Err(EngineError::invalid(format!(
                    "{}: sequence {} does not follow {}",
                    event.stream_id(),
                    event.sequence_number(),
                    prev
                )));
            }
        }
        if let Some(prev) = self.last_emitted_at {
            if event.emitted_at() < prev {
                return Err(EngineError::invalid(format!(
                    "{}: emitted_at regressed at sequence {}",
                    event.stream_id(),
                    event.sequence_number()
                )));
            }
        }
        self.last_sequence = Some(event.sequence_number());
        self.last_emitted_at = Some(event.emitted_at());
        Ok(())
    }
}

// ── Energy ───────────────────────────────────────────────────────────────────

/// Instantaneous and smoothed energy for one stream at one point in time.
/// Both values are clamped to [0,1] on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyValue {
    pub stream_id: StreamId,
    pub instant: f64,
    pub smoothed: f64,
    pub timestamp: Instant,
}

impl EnergyValue {
    pub fn new(stream_id: StreamId, instant: f64, smoothed: f64, timestamp: Instant) -> Self {
        Self {
            stream_id,
            instant: unit_clamp(instant),
            smoothed: unit_clamp(smoothed),
            timestamp,
        }
    }
}

/// Clamp into [0,1], mapping NaN to 0.
pub(crate) fn unit_clamp(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

// ── Ensemble ─────────────────────────────────────────────────────────────────

/// Disagreement among ensemble members, or an explicit "no data" marker.
///
/// Serialized as a number or `null`; never defaulted to a fabricated value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum DiversityIndex {
    Available(f64),
    Unavailable,
}

impl DiversityIndex {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Available(v) => Some(v),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, Self::Available(_))
    }
}

impl From<Option<f64>> for DiversityIndex {
    fn from(v: Option<f64>) -> Self {
        match v {
            Some(v) => Self::Available(unit_clamp(v)),
            None => Self::Unavailable,
        }
    }
}

impl From<DiversityIndex> for Option<f64> {
    fn from(di: DiversityIndex) -> Self {
        di.value()
    }
}

impl fmt::Display for DiversityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available(v) => write!(f, "{v:.3}"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Interference classification of one ensemble window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterferencePattern {
    #[default]
    Neutral,
    Constructive,
    Destructive,
}

impl fmt::Display for InterferencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Constructive => write!(f, "constructive"),
            Self::Destructive => write!(f, "destructive"),
        }
    }
}

/// A time-aligned bundle of member energies plus derived ensemble metrics.
///
/// `member_values` holds only streams that produced a token inside
/// `[window_start, window_end)`. Fewer members than requested is valid.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleSample {
    pub window_start: Instant,
    pub window_end: Instant,
    pub member_values: BTreeMap<StreamId, EnergyValue>,
    pub ensemble_energy: f64,
    pub diversity_index: DiversityIndex,
    pub pattern: InterferencePattern,
    /// Streams still alive when the window closed.
    pub active_streams: usize,
    /// Streams the run was asked to start.
    pub requested_streams: usize,
}

/// Values accepted by the composer intake queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposerInput {
    Sample(EnsembleSample),
    Energy(EnergyValue),
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// Per-stream energy in the outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamEnergy {
    pub stream_id: StreamId,
    pub instant: f64,
    pub smoothed: f64,
}

/// Aggregate energy carried by one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergySummary {
    pub ensemble_energy: f64,
    pub diversity_index: DiversityIndex,
    pub pattern: InterferencePattern,
    pub active_streams: usize,
    pub requested_streams: usize,
    /// Inputs folded into this frame; zero means the values are held over.
    pub sample_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_stream: Option<Vec<StreamEnergy>>,
}

impl Default for EnergySummary {
    fn default() -> Self {
        Self {
            ensemble_energy: 0.0,
            diversity_index: DiversityIndex::Unavailable,
            pattern: InterferencePattern::Neutral,
            active_streams: 0,
            requested_streams: 0,
            sample_count: 0,
            per_stream: None,
        }
    }
}

/// A non-neutral pattern detected in one ensemble window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEvent {
    pub pattern: InterferencePattern,
    pub ensemble_energy: f64,
    pub diversity_index: DiversityIndex,
    pub member_count: usize,
}

/// The outbound unit handed to the transport layer, one per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_number: u64,
    pub composed_at: DateTime<Utc>,
    pub energy_summary: EnergySummary,
    pub pattern_events: Vec<PatternEvent>,
    pub degraded: bool,
}
