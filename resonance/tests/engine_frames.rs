//! Engine control surface driving the frame clock.
//!
//! Runs on a paused tokio clock: the composer interval and the scripted
//! token delays advance together, so frame counts are deterministic.

use std::sync::Arc;
use std::time::Duration;

use resonance::source::{Script, ScriptedSource, TokenSource};
use resonance::{
    ComposerInput, Engine, EngineConfig, EngineError, EngineEvent, EnergyValue, Frame, ModelId,
    RunState, StreamId,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn demo_source() -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::new()
            .with_script("a", Script::wave(1000, 20, 0.0))
            .with_script("b", Script::wave(1000, 20, 1.7)),
    )
}

fn engine(source: Arc<ScriptedSource>) -> Arc<Engine> {
    let source: Arc<dyn TokenSource> = source;
    Arc::new(Engine::new(EngineConfig::default(), source).unwrap())
}

fn drain(mut rx: mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

#[tokio::test(start_paused = true)]
async fn test_frames_are_gapless_until_stop() {
    let engine = engine(demo_source());
    let (tx, rx) = mpsc::unbounded_channel();
    let clock = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_composer(tx).await }
    });

    let run = engine
        .start_ensemble(vec![ModelId::new("a"), ModelId::new("b")], "hello")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    engine.stop();

    let report = clock.await.unwrap();
    let run_report = run.wait().await.unwrap();
    let frames = drain(rx);

    assert!(frames.len() >= 55, "only {} frames in one second", frames.len());
    assert_eq!(report.frames, frames.len() as u64);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.frame_number, i as u64);
        let e = frame.energy_summary.ensemble_energy;
        assert!((0.0..=1.0).contains(&e));
    }
    assert!(frames.iter().any(|f| f.energy_summary.sample_count > 0));
    assert!(frames.iter().any(|f| f.energy_summary.ensemble_energy > 0.0));

    assert_eq!(run_report.final_state, RunState::Aborted);
    let stats = engine.stats();
    assert_eq!(stats.live_streams(), 0);
    assert!(stats.frames_emitted >= report.frames);
    assert_eq!(stats.queue_depth, 0);
    assert!(engine.intake().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stopped_engine_refuses_new_runs() {
    let engine = engine(demo_source());
    engine.stop();
    assert!(engine.is_stopped());
    let res = engine.start_ensemble(vec![ModelId::new("a")], "p");
    assert!(matches!(res, Err(EngineError::Cancelled(_))));
}

#[tokio::test(start_paused = true)]
async fn test_empty_ticks_hold_last_energy() {
    let engine = engine(demo_source());
    let (tx, rx) = mpsc::unbounded_channel();
    let clock = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_composer(tx).await }
    });

    engine.submit(ComposerInput::Energy(EnergyValue::new(
        StreamId(7),
        0.6,
        0.4,
        Instant::now(),
    )));
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.stop();
    clock.await.unwrap();

    let frames = drain(rx);
    let first = frames
        .iter()
        .position(|f| f.energy_summary.sample_count == 1)
        .unwrap();
    assert!((frames[first].energy_summary.ensemble_energy - 0.4).abs() < 1e-12);
    let held = &frames[first + 1..];
    assert!(!held.is_empty());
    for frame in held {
        assert_eq!(frame.energy_summary.sample_count, 0);
        assert!((frame.energy_summary.ensemble_energy - 0.4).abs() < 1e-12);
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_completes_and_reports_lifecycle() {
    let source = Arc::new(
        ScriptedSource::new().with_script("a", Script::new().repeat(10, 10, "x", Some(0.9))),
    );
    let engine = engine(source);
    let mut events = engine.subscribe();

    let run = engine.start_ensemble(vec![ModelId::new("a")], "p").unwrap();
    let run_id = run.run_id();
    let report = run.wait().await.unwrap();
    assert_eq!(report.final_state, RunState::Completed);
    assert!(report.samples_emitted > 0);
    // Samples wait in the intake until a composer drains them.
    assert!(!engine.intake().is_empty());

    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::StreamFinished { run_id: id, tokens, .. } = event {
            assert_eq!(id, run_id);
            assert_eq!(tokens, 10);
            finished += 1;
        }
    }
    assert_eq!(finished, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_unloads_models() {
    let source = Arc::new(
        ScriptedSource::new()
            .with_script("a", Script::new().repeat(3, 10, "x", None))
            .with_script("b", Script::new().repeat(3, 10, "x", None)),
    );
    let engine = engine(source.clone());
    let run = engine
        .start_ensemble(vec![ModelId::new("a"), ModelId::new("b")], "p")
        .unwrap();
    run.wait().await.unwrap();
    assert_eq!(engine.pool().loaded().await.len(), 2);

    engine.shutdown().await;
    assert!(engine.pool().loaded().await.is_empty());
    assert_eq!(source.unload_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stats_keep_only_the_last_finished_run() {
    let source = Arc::new(
        ScriptedSource::new().with_script("a", Script::new().repeat(3, 10, "x", Some(0.9))),
    );
    let engine = engine(source);

    let mut last = None;
    for _ in 0..5 {
        let run = engine.start_ensemble(vec![ModelId::new("a")], "p").unwrap();
        last = Some(run.run_id());
        run.wait().await.unwrap();
    }

    let stats = engine.stats();
    assert_eq!(stats.streams.len(), 1);
    assert_eq!(Some(stats.streams[0].run_id), last);
    assert_eq!(stats.live_streams(), 0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = EngineConfig::default();
    config.tier.max_parallel_models = 0;
    let source: Arc<dyn TokenSource> = Arc::new(ScriptedSource::new());
    assert!(matches!(
        Engine::new(config, source),
        Err(EngineError::Configuration(_))
    ));
}
