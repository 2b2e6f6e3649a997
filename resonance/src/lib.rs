//! Resonance: real-time token-energy engine
//!
//! Turns streaming token output from one or more language-model backends
//! into a bounded, frame-synchronized energy signal for a fixed-rate
//! consumer (60 frames/second by default).
//!
//! # Components
//!
//! - [`source`]: `TokenSource` contract, scripted and OpenAI-compatible backends
//! - [`energy`]: per-token energy mapping with EMA smoothing
//! - [`pool`]: tier-bounded model pool with LRU eviction and reload cooldown
//! - [`ensemble`]: concurrent runs, window alignment, DI and interference scoring
//! - [`composer`]: fixed-rate frame clock with backpressure and degraded mode
//! - [`engine`]: control surface (start-ensemble, stop, get-stats)
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use resonance::{Engine, EngineConfig, ModelId};
//! use resonance::source::{Script, ScriptedSource};
//!
//! let source = Arc::new(ScriptedSource::new().with_script("demo", Script::wave(200, 30, 0.0)));
//! let engine = Arc::new(Engine::new(EngineConfig::default(), source)?);
//! let (tx, mut frames) = tokio::sync::mpsc::channel(64);
//!
//! let clock = tokio::spawn({
//!     let engine = engine.clone();
//!     async move { engine.run_composer(tx).await }
//! });
//! let run = engine.start_ensemble(vec![ModelId::new("demo")], "hello")?;
//! while let Some(frame) = frames.recv().await { /* ... */ }
//! ```

pub mod composer;
pub mod config;
pub mod energy;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod events;
pub mod pool;
pub mod source;
pub mod stats;
pub mod types;

pub use composer::{ComposerReport, FrameComposer, FrameSink, IntakeQueue};
pub use config::{EngineConfig, HardwareTier, TierPolicy};
pub use energy::EnergyMapper;
pub use engine::{Engine, RunHandle};
pub use ensemble::{EnsembleOrchestrator, RunReport, RunState};
pub use error::{EngineError, EngineResult, ErrorCategory};
pub use events::{EngineEvent, EventBus};
pub use pool::{ModelHandle, ModelPool};
pub use source::{StreamHandle, TokenSource};
pub use stats::{EngineStats, StatsSnapshot};
pub use types::{
    ComposerInput, DiversityIndex, EnergySummary, EnergyValue, EnsembleSample, Frame,
    InterferencePattern, ModelId, PatternEvent, RunId, StreamId, TokenEvent,
};
