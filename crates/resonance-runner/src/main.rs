//! Resonance runner
//!
//! Drives one ensemble run and writes every composed frame to stdout as a
//! JSON line. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Scripted backend, no model server needed
//! resonance-runner --demo --frames 600
//!
//! # OpenAI-compatible server (llama.cpp, vLLM, ...)
//! resonance-runner --model qwen2.5-7b --model llama-3.1-8b --prompt "Explain borrowck"
//!
//! # Tier preset and overrides from the environment
//! RESONANCE_TIER=minimal RUST_LOG=resonance=debug resonance-runner --demo
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use resonance::source::{OpenAiConfig, OpenAiSource, Script, ScriptedSource, TokenSource};
use resonance::{Engine, EngineConfig, EngineResult, Frame, FrameSink, ModelId};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML engine configuration (defaults apply to anything omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model to include in the ensemble, in priority order (repeatable)
    #[arg(long = "model")]
    models: Vec<String>,

    /// Prompt sent to every model
    #[arg(long, default_value = "Write a short poem about resonance.")]
    prompt: String,

    /// Use the built-in scripted backend instead of a model server
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Backend base URL (overrides RESONANCE_BACKEND_URL)
    #[arg(long)]
    backend_url: Option<String>,
}

/// Frames queued between the clock and the stdout writer.
const WRITER_BACKLOG: usize = 256;

/// Hands frames to the stdout writer and stops the engine after `limit`.
///
/// The clock never waits on stdout: a full backlog drops the frame.
struct LimitedSink {
    frames: mpsc::Sender<Frame>,
    delivered: u64,
    limit: Option<u64>,
    stop: CancellationToken,
}

impl LimitedSink {
    fn new(frames: mpsc::Sender<Frame>, limit: Option<u64>, stop: CancellationToken) -> Self {
        Self {
            frames,
            delivered: 0,
            limit,
            stop,
        }
    }
}

impl FrameSink for LimitedSink {
    fn deliver(&mut self, frame: Frame) -> EngineResult<()> {
        self.frames.deliver(frame)?;
        self.delivered += 1;
        if self.limit.is_some_and(|limit| self.delivered >= limit) {
            self.stop.cancel();
        }
        Ok(())
    }
}

/// Write each frame as one JSON line until the sink side hangs up.
async fn write_frames<W: AsyncWrite + Unpin>(
    mut frames: mpsc::Receiver<Frame>,
    out: W,
) -> Result<u64> {
    let mut out = tokio::io::BufWriter::new(out);
    let mut written = 0;
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_vec(&frame).context("encoding frame")?;
        line.push(b'\n');
        out.write_all(&line).await.context("writing frame")?;
        if frames.is_empty() {
            out.flush().await.context("flushing frames")?;
        }
        written += 1;
    }
    out.flush().await.context("flushing frames")?;
    Ok(written)
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_toml_str(&text)?
        }
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn demo_source(models: &[ModelId], buffer: usize) -> ScriptedSource {
    models
        .iter()
        .enumerate()
        .fold(ScriptedSource::new().with_buffer(buffer), |source, (i, model)| {
            let script = Script::wave(2_000, 25 + 10 * i as u64, i as f64 * 1.3);
            source.with_script(model.clone(), script)
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(args.config.as_ref())?;

    let mut models: Vec<ModelId> = args.models.iter().map(ModelId::new).collect();
    let source: Arc<dyn TokenSource> = if args.demo {
        if models.is_empty() {
            models = ["demo-a", "demo-b", "demo-c"].into_iter().map(ModelId::new).collect();
        }
        Arc::new(demo_source(&models, config.stream.buffer))
    } else {
        if models.is_empty() {
            bail!("at least one --model is required unless --demo is set");
        }
        let mut backend = OpenAiConfig {
            buffer: config.stream.buffer,
            ..OpenAiConfig::default()
        };
        if let Some(url) = args.backend_url.clone() {
            backend.base_url = url;
        }
        Arc::new(OpenAiSource::new(backend)?)
    };

    info!(
        backend = source.name(),
        models = ?models.iter().map(ModelId::as_str).collect::<Vec<_>>(),
        "Resonance runner starting"
    );

    let engine = Arc::new(Engine::new(config, source)?);
    let frame_budget = engine.config().tier.frame_budget();

    let mut events = engine.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = event.event_type(), "{}", json),
                    Err(e) => warn!("Unencodable event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (frames_tx, frames_rx) = mpsc::channel(WRITER_BACKLOG);
    let writer = tokio::spawn(write_frames(frames_rx, tokio::io::stdout()));
    let sink = LimitedSink::new(frames_tx, args.frames, engine.stop_token());
    let clock = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_composer(sink).await }
    });

    let run = engine.start_ensemble(models, args.prompt.clone())?;
    let run_id = run.run_id();
    let mut run_task = tokio::spawn(run.wait());
    let stop = engine.stop_token();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = stop.cancelled() => info!("Frame limit reached"),
        res = &mut run_task => {
            match res {
                Ok(Ok(report)) => info!(
                    %run_id,
                    state = %report.final_state,
                    samples = report.samples_emitted,
                    streams = report.streams.len(),
                    "Run finished"
                ),
                Ok(Err(e)) => warn!(%run_id, "Run failed: {}", e),
                Err(e) => warn!(%run_id, "Run task panicked: {}", e),
            }
            // Let the clock publish the closing samples.
            tokio::time::sleep(frame_budget * 4).await;
        }
    }

    engine.stop();
    let composer = clock.await.context("composer task")?;
    let written = writer.await.context("frame writer task")??;
    engine.shutdown().await;
    event_log.abort();

    let stats = engine.stats();
    info!(
        frames = composer.frames,
        written,
        overruns = composer.overruns,
        dropped = stats.dropped_inputs,
        invalid_events = stats.invalid_events,
        p95_us = stats.frame_timing.p95_us,
        "Resonance runner stopped"
    );
    if stats.frame_overruns > 0 {
        warn!(overruns = stats.frame_overruns, "Frame budget was exceeded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_source_loads_requested_models() {
        let models = vec![ModelId::new("x"), ModelId::new("y")];
        let source = demo_source(&models, 8);
        for model in &models {
            assert!(source.load_model(model).await.is_ok());
        }
        assert!(source.load_model(&ModelId::new("z")).await.is_err());
    }

    fn frame(frame_number: u64) -> Frame {
        Frame {
            frame_number,
            composed_at: chrono::Utc::now(),
            energy_summary: Default::default(),
            pattern_events: Vec::new(),
            degraded: false,
        }
    }

    #[tokio::test]
    async fn test_sink_never_waits_on_a_full_writer() {
        let (tx, mut rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let mut sink = LimitedSink::new(tx, Some(3), stop.clone());

        // Nobody reads: the second and third frames are dropped, not awaited.
        for n in 0..3 {
            assert!(sink.deliver(frame(n)).is_ok());
        }
        assert!(stop.is_cancelled());
        assert_eq!(rx.recv().await.unwrap().frame_number, 0);

        drop(rx);
        assert!(sink.deliver(frame(3)).is_err());
    }

    #[tokio::test]
    async fn test_writer_emits_one_json_line_per_frame() {
        let (tx, rx) = mpsc::channel(4);
        for n in 0..3 {
            tx.send(frame(n)).await.unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        let written = write_frames(rx, &mut out).await.unwrap();
        assert_eq!(written, 3);

        let text = String::from_utf8(out).unwrap();
        let numbers: Vec<u64> = text
            .lines()
            .map(|l| serde_json::from_str::<Frame>(l).unwrap().frame_number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_args_collect_repeated_models() {
        let args = Args::parse_from([
            "resonance-runner",
            "--model",
            "a",
            "--model",
            "b",
            "--frames",
            "10",
        ]);
        assert_eq!(args.models, vec!["a", "b"]);
        assert_eq!(args.frames, Some(10));
        assert!(!args.demo);
    }

    #[test]
    fn test_stream_buffer_reaches_the_demo_backend() {
        let mut config = EngineConfig::default();
        config.stream.buffer = 5;
        let source = demo_source(&[ModelId::new("x")], config.stream.buffer);
        assert_eq!(source.buffer(), 5);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/resonance.toml");
        assert!(load_config(Some(&path)).is_err());
    }
}
