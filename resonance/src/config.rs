//! Engine configuration.
//!
//! All tuning parameters live here as explicit, named values so tests can
//! assert on them. Every section deserializes with `#[serde(default)]`, so a
//! TOML file only needs to mention what it overrides:
//!
//! ```toml
//! [tier]
//! max_parallel_models = 2
//! max_loaded_models = 3
//!
//! [energy]
//! alpha = 0.25
//!
//! [ensemble.model_weights]
//! "qwen2.5-coder-7b" = 1.2
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::source::RetryPolicy;

/// Frame period for a 60 Hz consumer.
pub const DEFAULT_FRAME_BUDGET_MS: f64 = 16.67;

/// Certainty assumed for tokens whose backend exposes no logits. Sits in the
/// middle of [0,1] so streams without logits are neither boosted nor damped.
pub const NEUTRAL_CERTAINTY: f64 = 0.5;

/// EMA smoothing factor for per-stream energy.
pub const DEFAULT_EMA_ALPHA: f64 = 0.2;

/// How far ensemble energy may exceed the strongest member.
pub const DEFAULT_AMPLIFICATION_EPSILON: f64 = 0.05;

/// Hardware capability class used to pick a [`TierPolicy`] preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareTier {
    /// Laptop-class: one model at a time.
    Minimal,
    /// Single workstation GPU.
    Standard,
    /// Multi-GPU host.
    Performance,
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Standard => write!(f, "standard"),
            Self::Performance => write!(f, "performance"),
        }
    }
}

impl FromStr for HardwareTier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" | "low" => Ok(Self::Minimal),
            "standard" | "mid" => Ok(Self::Standard),
            "performance" | "high" => Ok(Self::Performance),
            other => Err(EngineError::Configuration(format!(
                "unknown hardware tier '{other}'"
            ))),
        }
    }
}

/// Capacity limits for the current hardware tier. Immutable for the
/// process lifetime once the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPolicy {
    /// Streams an ensemble may run concurrently.
    pub max_parallel_models: usize,
    /// Models the pool keeps materialized at once.
    pub max_loaded_models: usize,
    /// Hard per-frame time budget.
    pub frame_budget_ms: f64,
    /// Composition time above which the composer pre-emptively degrades.
    pub degrade_threshold_ms: f64,
}

impl TierPolicy {
    pub fn for_tier(tier: HardwareTier) -> Self {
        match tier {
            HardwareTier::Minimal => Self {
                max_parallel_models: 1,
                max_loaded_models: 2,
                frame_budget_ms: DEFAULT_FRAME_BUDGET_MS,
                degrade_threshold_ms: 10.0,
            },
            HardwareTier::Standard => Self {
                max_parallel_models: 3,
                max_loaded_models: 4,
                frame_budget_ms: DEFAULT_FRAME_BUDGET_MS,
                degrade_threshold_ms: 12.0,
            },
            HardwareTier::Performance => Self {
                max_parallel_models: 6,
                max_loaded_models: 8,
                frame_budget_ms: DEFAULT_FRAME_BUDGET_MS,
                degrade_threshold_ms: 14.0,
            },
        }
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(self.frame_budget_ms / 1000.0)
    }

    pub fn degrade_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.degrade_threshold_ms / 1000.0)
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::for_tier(HardwareTier::Standard)
    }
}

/// Per-token energy mapping parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// EMA factor: `smoothed = α·instant + (1-α)·smoothed_prev`.
    pub alpha: f64,
    /// Delay at which the cadence factor equals 0.5.
    pub cadence_reference_ms: f64,
    /// Delays beyond this start the stall penalty.
    pub stall_threshold_ms: f64,
    /// E-folding time of the stall penalty past the threshold.
    pub stall_decay_ms: f64,
    pub cadence_weight: f64,
    pub certainty_weight: f64,
    /// Certainty used when a token carries none.
    pub neutral_certainty: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_EMA_ALPHA,
            cadence_reference_ms: 50.0,
            stall_threshold_ms: 750.0,
            stall_decay_ms: 500.0,
            cadence_weight: 0.5,
            certainty_weight: 0.5,
            neutral_certainty: NEUTRAL_CERTAINTY,
        }
    }
}

/// Ensemble alignment, scoring and classification parameters.
///
/// The classification thresholds are tuning knobs, not derived constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Alignment window length; one window per frame tick by default.
    pub window_ms: f64,
    /// Ensemble energy never exceeds `max(member instants) + epsilon`.
    pub amplification_epsilon: f64,
    /// Strength of interference applied to the weighted mean.
    pub interference_gain: f64,
    pub constructive_min_energy: f64,
    pub constructive_max_spread: f64,
    pub constructive_max_diversity: f64,
    pub destructive_min_spread: f64,
    pub destructive_min_diversity: f64,
    /// Capacity of the producer → merge-loop channel.
    pub channel_capacity: usize,
    /// Per-model confidence factor γ_m; models not listed weigh 1.0.
    pub model_weights: HashMap<String, f64>,
}

impl EnsembleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_ms / 1000.0)
    }

    pub fn weight_for(&self, model_id: &str) -> f64 {
        self.model_weights.get(model_id).copied().unwrap_or(1.0)
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_FRAME_BUDGET_MS,
            amplification_epsilon: DEFAULT_AMPLIFICATION_EPSILON,
            interference_gain: 0.25,
            constructive_min_energy: 0.6,
            constructive_max_spread: 0.1,
            constructive_max_diversity: 0.35,
            destructive_min_spread: 0.25,
            destructive_min_diversity: 0.5,
            channel_capacity: 256,
            model_weights: HashMap::new(),
        }
    }
}

/// Frame composer intake and hysteresis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Bound of the intake queue; the oldest input is dropped when full.
    pub queue_capacity: usize,
    /// Queue depth at which degraded mode is entered.
    pub high_water: usize,
    /// Queue depth under which recovery ticks are counted.
    pub low_water: usize,
    /// Consecutive calm ticks needed to leave degraded mode.
    pub recovery_ticks: u32,
    /// Number of recent frame timings kept for percentiles.
    pub timing_window: usize,
    /// Include the per-stream breakdown in non-degraded frames.
    pub per_stream_breakdown: bool,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            high_water: 64,
            low_water: 16,
            recovery_ticks: 30,
            timing_window: 600,
            per_stream_breakdown: true,
        }
    }
}

/// Model pool parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// A just-evicted model cannot be reloaded inside this window.
    pub reload_cooldown_ms: u64,
    /// Bound on one backend load or unload. The pool lock is held across it.
    pub load_timeout_ms: u64,
}

impl PoolConfig {
    pub fn reload_cooldown(&self) -> Duration {
        Duration::from_millis(self.reload_cooldown_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reload_cooldown_ms: 2_000,
            load_timeout_ms: 15_000,
        }
    }
}

/// Per-stream I/O limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// No token for this long fails the stream.
    pub stream_timeout_ms: u64,
    /// Bound on a backend health check.
    pub health_check_timeout_ms: u64,
    /// Capacity of each stream's event buffer.
    pub buffer: usize,
}

impl StreamConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_timeout_ms: 10_000,
            health_check_timeout_ms: 2_000,
            buffer: 64,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tier: TierPolicy,
    pub energy: EnergyConfig,
    pub ensemble: EnsembleConfig,
    pub composer: ComposerConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub stream: StreamConfig,
}

impl EngineConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RESONANCE_*` environment overrides on top of this config.
    ///
    /// `RESONANCE_TIER` replaces the whole tier policy with a preset; the
    /// individual limits are applied after it.
    pub fn with_env_overrides(mut self) -> EngineResult<Self> {
        if let Ok(tier) = std::env::var("RESONANCE_TIER") {
            self.tier = TierPolicy::for_tier(tier.parse()?);
        }
        if let Some(ms) = env_parse::<f64>("RESONANCE_FRAME_BUDGET_MS") {
            self.tier.frame_budget_ms = ms;
        }
        if let Some(n) = env_parse::<usize>("RESONANCE_MAX_PARALLEL_MODELS") {
            self.tier.max_parallel_models = n;
        }
        if let Some(n) = env_parse::<usize>("RESONANCE_MAX_LOADED_MODELS") {
            self.tier.max_loaded_models = n;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: String| Err(EngineError::Configuration(msg));

        if self.tier.max_parallel_models == 0 {
            return fail("tier.max_parallel_models must be at least 1".into());
        }
        if self.tier.max_loaded_models < self.tier.max_parallel_models {
            return fail(format!(
                "tier.max_loaded_models ({}) must be >= max_parallel_models ({})",
                self.tier.max_loaded_models, self.tier.max_parallel_models
            ));
        }
        if !(self.tier.frame_budget_ms > 0.0) {
            return fail("tier.frame_budget_ms must be positive".into());
        }
        if !(self.tier.degrade_threshold_ms > 0.0)
            || self.tier.degrade_threshold_ms > self.tier.frame_budget_ms
        {
            return fail("tier.degrade_threshold_ms must be in (0, frame_budget_ms]".into());
        }
        if !(self.energy.alpha > 0.0 && self.energy.alpha <= 1.0) {
            return fail(format!("energy.alpha {} must be in (0, 1]", self.energy.alpha));
        }
        if !(self.energy.cadence_reference_ms > 0.0) || !(self.energy.stall_decay_ms > 0.0) {
            return fail("energy time constants must be positive".into());
        }
        if self.energy.cadence_weight < 0.0
            || self.energy.certainty_weight < 0.0
            || !(self.energy.cadence_weight + self.energy.certainty_weight > 0.0)
        {
            return fail("energy weights must be non-negative and not both zero".into());
        }
        if !(0.0..=1.0).contains(&self.energy.neutral_certainty) {
            return fail("energy.neutral_certainty must be in [0, 1]".into());
        }
        if !(self.ensemble.window_ms > 0.0) {
            return fail("ensemble.window_ms must be positive".into());
        }
        if let Some((model, w)) = self
            .ensemble
            .model_weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return fail(format!("ensemble.model_weights[{model}] = {w} is invalid"));
        }
        if self.ensemble.amplification_epsilon < 0.0 {
            return fail("ensemble.amplification_epsilon must be non-negative".into());
        }
        if self.ensemble.channel_capacity == 0 {
            return fail("ensemble.channel_capacity must be at least 1".into());
        }
        if self.composer.queue_capacity == 0 {
            return fail("composer.queue_capacity must be at least 1".into());
        }
        if self.composer.low_water >= self.composer.high_water {
            return fail(format!(
                "composer.low_water ({}) must be below high_water ({})",
                self.composer.low_water, self.composer.high_water
            ));
        }
        if self.composer.high_water > self.composer.queue_capacity {
            return fail("composer.high_water must not exceed queue_capacity".into());
        }
        if self.pool.load_timeout_ms == 0 {
            return fail("pool.load_timeout_ms must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return fail(format!("retry.jitter = {} must lie in [0, 1]", self.retry.jitter));
        }
        if self.stream.buffer == 0 {
            return fail("stream.buffer must be at least 1".into());
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tier.frame_budget_ms, 16.67);
        assert_eq!(config.energy.neutral_certainty, NEUTRAL_CERTAINTY);
        assert_eq!(config.ensemble.window_ms, config.tier.frame_budget_ms);
    }

    #[test]
    fn test_tier_presets_scale() {
        let min = TierPolicy::for_tier(HardwareTier::Minimal);
        let perf = TierPolicy::for_tier(HardwareTier::Performance);
        assert!(min.max_parallel_models < perf.max_parallel_models);
        assert!(min.max_loaded_models >= min.max_parallel_models);
        assert_eq!(TierPolicy::default(), TierPolicy::for_tier(HardwareTier::Standard));
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("high".parse::<HardwareTier>().unwrap(), HardwareTier::Performance);
        assert_eq!(" Minimal ".parse::<HardwareTier>().unwrap(), HardwareTier::Minimal);
        assert!("gigantic".parse::<HardwareTier>().is_err());
    }

    #[test]
    fn test_frame_budget_duration() {
        let tier = TierPolicy::default();
        assert!((16_669..=16_670).contains(&tier.frame_budget().as_micros()));
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [tier]
            max_parallel_models = 2
            max_loaded_models = 3

            [energy]
            alpha = 0.3

            [ensemble.model_weights]
            "qwen-7b" = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.tier.max_parallel_models, 2);
        assert_eq!(config.tier.frame_budget_ms, DEFAULT_FRAME_BUDGET_MS);
        assert_eq!(config.energy.alpha, 0.3);
        assert_eq!(config.ensemble.weight_for("qwen-7b"), 1.5);
        assert_eq!(config.ensemble.weight_for("other"), 1.0);
    }

    #[test]
    fn test_rejects_bad_alpha() {
        let err = EngineConfig::from_toml_str("[energy]\nalpha = 0.0\n").unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let mut config = EngineConfig::default();
        config.composer.low_water = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_loaded_below_parallel() {
        let mut config = EngineConfig::default();
        config.tier.max_parallel_models = 5;
        config.tier.max_loaded_models = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_weight() {
        let mut config = EngineConfig::default();
        config.ensemble.model_weights.insert("m".into(), -1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_retry_jitter() {
        let err = EngineConfig::from_toml_str("[retry]\njitter = 1.5\n").unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        let ok = EngineConfig::from_toml_str("[retry]\nattempts = 5\njitter = 0.0\n").unwrap();
        assert_eq!(ok.retry.attempts, 5);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
