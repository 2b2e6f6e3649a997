//! Per-stream energy mapping.
//!
//! Instant energy blends three normalized factors:
//!
//! ```text
//! cadence   = ref / (ref + delay)           delay <= 0 → 1.0
//! certainty = token certainty, or NEUTRAL_CERTAINTY
//! stall     = 1                             delay <= threshold
//!           = exp(-(delay - threshold)/τ)   otherwise
//!
//! instant   = clamp((w_c·cadence + w_k·certainty) / (w_c + w_k) · stall)
//! smoothed  = α·instant + (1-α)·smoothed_prev      (first token: = instant)
//! ```
//!
//! One mapper per stream, owned by that stream's producer task.

use crate::config::EnergyConfig;
use crate::types::{unit_clamp, EnergyValue, StreamId, TokenEvent};

#[derive(Debug, Clone)]
pub struct EnergyMapper {
    stream_id: StreamId,
    config: EnergyConfig,
    smoothed: Option<f64>,
    observed: u64,
}

impl EnergyMapper {
    pub fn new(stream_id: StreamId, config: EnergyConfig) -> Self {
        Self {
            stream_id,
            config,
            smoothed: None,
            observed: 0,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Tokens observed so far.
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Last smoothed value, `None` before the first token.
    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    /// Fold one token into the stream's energy.
    pub fn observe(&mut self, event: &TokenEvent) -> EnergyValue {
        let instant = self.instant_energy(event.inter_token_delay_ms(), event.certainty());
        let alpha = self.config.alpha;
        let smoothed = match self.smoothed {
            None => instant,
            Some(prev) => unit_clamp(alpha * instant + (1.0 - alpha) * prev),
        };
        self.smoothed = Some(smoothed);
        self.observed += 1;
        EnergyValue::new(self.stream_id, instant, smoothed, event.emitted_at())
    }

    /// Stateless part of the mapping.
    pub fn instant_energy(&self, delay_ms: f64, certainty: Option<f64>) -> f64 {
        let c = &self.config;
        let cadence = cadence_factor(delay_ms, c.cadence_reference_ms);
        let certainty = match certainty {
            Some(v) if v.is_finite() => unit_clamp(v),
            _ => c.neutral_certainty,
        };
        let stall = stall_factor(delay_ms, c.stall_threshold_ms, c.stall_decay_ms);

        let total = c.cadence_weight + c.certainty_weight;
        if !(total > 0.0) {
            return 0.0;
        }
        let blended = (c.cadence_weight * cadence + c.certainty_weight * certainty) / total;
        unit_clamp(blended * stall)
    }
}

fn cadence_factor(delay_ms: f64, reference_ms: f64) -> f64 {
    if delay_ms.is_nan() || delay_ms <= 0.0 {
        return 1.0;
    }
    if delay_ms.is_infinite() {
        return 0.0;
    }
    unit_clamp(reference_ms / (reference_ms + delay_ms))
}

fn stall_factor(delay_ms: f64, threshold_ms: f64, decay_ms: f64) -> f64 {
    if delay_ms.is_nan() || delay_ms <= threshold_ms {
        return 1.0;
    }
    if delay_ms.is_infinite() {
        return 0.0;
    }
    unit_clamp((-(delay_ms - threshold_ms) / decay_ms).exp())
}
