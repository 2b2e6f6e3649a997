//! Multi-model ensemble runs.
//!
//! - [`state`]: run lifecycle with legal-transition guards
//! - [`scoring`]: per-window ensemble energy, diversity index, pattern
//! - [`orchestrator`]: concurrent producers feeding one merge loop

pub mod orchestrator;
pub mod scoring;
pub mod state;

use tokio::sync::mpsc;

use crate::types::EnsembleSample;

pub use orchestrator::{EnsembleOrchestrator, RunReport, StreamOutcome};
pub use scoring::{
    bounded_ensemble_energy, diversity_index, score_window, TokenObservation, WindowMember,
    WindowScore,
};
pub use state::{IllegalTransition, RunState, RunStateMachine, TransitionRecord};

/// Where a run delivers its closed windows.
pub trait SampleSink: Send + Sync {
    fn push_sample(&self, sample: EnsembleSample);
}

impl SampleSink for mpsc::UnboundedSender<EnsembleSample> {
    fn push_sample(&self, sample: EnsembleSample) {
        // A dropped receiver means nobody wants samples any more.
        let _ = self.send(sample);
    }
}
