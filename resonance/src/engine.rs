//! Engine control surface: start-ensemble, composer clock, stop, stats.
//!
//! The engine owns one of each shared component and injects them into the
//! pool, the orchestrator and the composer:
//!
//! ```text
//!            ┌──────────── EngineStats / EventBus ─────────────┐
//!            ▼                    ▼                             ▼
//!  ModelPool ◀── EnsembleOrchestrator ──▶ IntakeQueue ──▶ FrameComposer ──▶ FrameSink
//! ```
//!
//! `stop()` is the global stop: it cancels the composer clock and every
//! run started through this engine.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::composer::{ComposerReport, FrameComposer, FrameSink, IntakeQueue, SharedIntake};
use crate::config::EngineConfig;
use crate::ensemble::{EnsembleOrchestrator, RunReport, SampleSink};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, SharedEventBus};
use crate::pool::ModelPool;
use crate::source::TokenSource;
use crate::stats::{EngineStats, SharedStats, StatsSnapshot};
use crate::types::{ComposerInput, ModelId, RunId};

/// A running ensemble.
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<EngineResult<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Abort this run only. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> EngineResult<RunReport> {
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(EngineError::Cancelled(format!(
                "{} task ended abnormally: {e}",
                self.run_id
            ))),
        }
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    pool: Arc<ModelPool>,
    orchestrator: Arc<EnsembleOrchestrator>,
    intake: SharedIntake,
    stats: SharedStats,
    bus: SharedEventBus,
    stop: CancellationToken,
    runs: CancellationToken,
}

impl Engine {
    /// Validate `config` and wire the components around `source`.
    pub fn new(config: EngineConfig, source: Arc<dyn TokenSource>) -> EngineResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let stats = EngineStats::new(config.composer.timing_window).shared();
        let bus = EventBus::new().shared();
        let pool = Arc::new(
            ModelPool::new(source.clone(), config.tier.clone(), config.pool.clone())
                .with_event_bus(bus.clone()),
        );
        let orchestrator = Arc::new(EnsembleOrchestrator::new(
            config.clone(),
            source.clone(),
            pool.clone(),
            stats.clone(),
            bus.clone(),
        ));
        let intake = IntakeQueue::new(config.composer.queue_capacity).shared();

        info!(
            backend = source.name(),
            max_parallel = config.tier.max_parallel_models,
            max_loaded = config.tier.max_loaded_models,
            frame_budget_ms = config.tier.frame_budget_ms,
            "Engine initialized"
        );

        Ok(Self {
            config,
            pool,
            orchestrator,
            intake,
            stats,
            bus,
            stop: CancellationToken::new(),
            runs: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn intake(&self) -> &SharedIntake {
        &self.intake
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Queue a value for the composer from outside an ensemble run.
    pub fn submit(&self, input: ComposerInput) {
        self.intake.push(input);
    }

    /// Start an ensemble over `model_ids` (priority order) in the background.
    pub fn start_ensemble(
        &self,
        model_ids: Vec<ModelId>,
        prompt: impl Into<String>,
    ) -> EngineResult<RunHandle> {
        if self.stop.is_cancelled() {
            return Err(EngineError::Cancelled("engine stopped".into()));
        }
        let run_id = self.orchestrator.allocate_run_id();
        let cancel = self.runs.child_token();
        let orchestrator = self.orchestrator.clone();
        let sink: Arc<dyn SampleSink> = self.intake.clone();
        let prompt = prompt.into();
        let run_cancel = cancel.clone();
        let stats = self.stats.clone();

        let task = tokio::spawn(async move {
            let res = orchestrator
                .run(run_id, &model_ids, &prompt, sink, run_cancel)
                .await;
            if let Err(e) = &res {
                warn!(%run_id, "Ensemble run failed: {}", e);
            }
            stats.retire_run(run_id);
            res
        });

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    /// A composer wired to this engine's intake, stats and bus.
    pub fn composer(&self) -> FrameComposer {
        FrameComposer::new(
            self.config.tier.clone(),
            self.config.composer.clone(),
            self.intake.clone(),
            self.stats.clone(),
            self.bus.clone(),
        )
    }

    /// Drive the frame clock until [`Engine::stop`] or a sink failure.
    pub async fn run_composer<S: FrameSink>(&self, sink: S) -> ComposerReport {
        self.composer()
            .run(sink, self.stop.clone(), self.runs.clone())
            .await
    }

    /// Global stop: halts the clock, cancels every run, drains the queue.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Engine stop requested");
        }
        self.stop.cancel();
        self.runs.cancel();
        self.intake.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled by [`Engine::stop`].
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop and unload every model.
    pub async fn shutdown(&self) {
        self.stop();
        self.pool.shutdown().await;
    }
}
