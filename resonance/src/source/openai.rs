//! OpenAI-compatible streaming backend (llama.cpp server, vLLM, Ollama).
//!
//! Streams `POST {base_url}/chat/completions` with `stream: true` and
//! `logprobs: true`. Each SSE `data:` line is one chunk; `data: [DONE]`
//! terminates. Token certainty is `exp(logprob)` of the sampled token and
//! `top_logprobs` become the alternatives used for the diversity index.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ModelFootprint, StreamHandle, StreamSender, TokenSource};
use crate::error::{EngineError, EngineResult};
use crate::types::{ModelId, StreamId, TokenAlternative, TokenEvent};

/// Connection settings for an OpenAI-compatible server.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL including the `/v1` suffix.
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Alternatives requested per token (0 disables them).
    pub top_logprobs: u8,
    pub connect_timeout: Duration,
    /// Bound on non-streaming requests (`GET /models`).
    pub request_timeout: Duration,
    pub buffer: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("RESONANCE_BACKEND_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080/v1".to_string()),
            api_key: std::env::var("RESONANCE_BACKEND_API_KEY").ok(),
            max_tokens: 512,
            temperature: 0.7,
            top_logprobs: 5,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            buffer: 64,
        }
    }
}

/// Backend speaking the OpenAI chat-completions streaming protocol.
pub struct OpenAiSource {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiSource {
    pub fn new(config: OpenAiConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        #[derive(Deserialize)]
        struct ModelList {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let req = self
            .http
            .get(self.url("models"))
            .timeout(self.config.request_timeout);
        let resp = self.authorize(req).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "GET /models returned {}",
                resp.status()
            )));
        }
        let list: ModelList = resp.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    logprobs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u8>,
}

#[async_trait]
impl TokenSource for OpenAiSource {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn health_check(&self) -> EngineResult<()> {
        self.list_models().await.map(|_| ())
    }

    async fn load_model(&self, model_id: &ModelId) -> EngineResult<ModelFootprint> {
        let models = self.list_models().await?;
        if models.iter().any(|m| m == model_id.as_str()) {
            Ok(ModelFootprint::default())
        } else {
            Err(EngineError::load_failed(
                model_id,
                format!("backend serves {} model(s), not this one", models.len()),
            ))
        }
    }

    async fn start(
        &self,
        stream_id: StreamId,
        model_id: &ModelId,
        prompt: &str,
    ) -> EngineResult<StreamHandle> {
        let body = ChatRequest {
            model: model_id.as_str(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
            logprobs: true,
            top_logprobs: (self.config.top_logprobs > 0).then_some(self.config.top_logprobs),
        };

        let resp = self
            .authorize(self.http.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::load_failed(model_id, "model not found (404)"));
        }
        if !status.is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "chat/completions returned {status}"
            )));
        }

        let (tx, handle) = StreamHandle::channel(stream_id, model_id.clone(), self.config.buffer);
        tokio::spawn(pump(stream_id, resp, tx));
        Ok(handle)
    }
}

/// Forward SSE chunks from `resp` into the stream until `[DONE]`, an error,
/// or cancellation. Dropping `resp` on cancel closes the connection.
async fn pump(stream_id: StreamId, resp: reqwest::Response, tx: StreamSender) {
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::new(stream_id);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = tx.cancelled() => return,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for item in decoder.feed(&bytes) {
                    if !tx.send(item).await {
                        return;
                    }
                }
                if decoder.is_done() {
                    return;
                }
            }
            Some(Err(e)) => {
                tx.send(Err(EngineError::BackendUnavailable(e.to_string()))).await;
                return;
            }
            None => {
                debug!(%stream_id, "Backend closed stream without terminator");
                tx.send(decoder.finish()).await;
                return;
            }
        }
    }
}

/// Turns raw response bytes into stream items.
///
/// Bytes are buffered until a full line is present, so a multi-byte
/// character split across network chunks decodes intact.
struct SseDecoder {
    stream_id: StreamId,
    pending: Vec<u8>,
    seq: u64,
    last: Instant,
    done: bool,
}

impl SseDecoder {
    fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            pending: Vec::new(),
            seq: 0,
            last: Instant::now(),
            done: false,
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// Items for every line completed by `bytes`. Nothing after `[DONE]`.
    fn feed(&mut self, bytes: &[u8]) -> Vec<EngineResult<TokenEvent>> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while !self.done {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            match parse_sse_line(line.trim_end()) {
                SseLine::Tokens(tokens) => {
                    out.extend(tokens.into_iter().map(|t| self.token(t)));
                }
                SseLine::Done => out.push(self.finish()),
                SseLine::Malformed(reason) => {
                    warn!(stream_id = %self.stream_id, "Malformed SSE chunk: {}", reason);
                    out.push(Err(EngineError::invalid(format!(
                        "malformed SSE chunk: {reason}"
                    ))));
                }
                SseLine::Ignore => {}
            }
        }
        out
    }

    fn token(&mut self, token: ParsedToken) -> EngineResult<TokenEvent> {
        let now = Instant::now();
        let delay_ms = now.duration_since(self.last).as_secs_f64() * 1000.0;
        self.last = now;
        let mut builder = TokenEvent::builder(self.stream_id, self.seq)
            .at(now)
            .with_delay_ms(delay_ms)
            .with_text(token.text)
            .with_alternatives(token.alternatives);
        if let Some(c) = token.certainty {
            builder = builder.with_certainty(c);
        }
        let event = builder.build()?;
        self.seq += 1;
        Ok(event)
    }

    fn finish(&mut self) -> EngineResult<TokenEvent> {
        self.done = true;
        TokenEvent::builder(self.stream_id, self.seq).finished().build()
    }
}

/// One token extracted from a streaming chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToken {
    pub text: String,
    pub certainty: Option<f64>,
    pub alternatives: Vec<TokenAlternative>,
}

/// Classification of one SSE line.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Tokens(Vec<ParsedToken>),
    Done,
    Malformed(String),
    Ignore,
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    content: Option<Vec<LogprobEntry>>,
}

#[derive(Deserialize)]
struct LogprobEntry {
    token: String,
    logprob: f64,
    #[serde(default)]
    top_logprobs: Vec<TopLogprob>,
}

#[derive(Deserialize)]
struct TopLogprob {
    token: String,
    logprob: f64,
}

fn probability(logprob: f64) -> Option<f64> {
    let p = logprob.exp();
    (p.is_finite() && (0.0..=1.0).contains(&p)).then_some(p)
}

/// Parse one SSE line of a chat-completions stream.
pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:` lines and keep-alive blanks.
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    if data.is_empty() {
        return SseLine::Ignore;
    }

    let chunk: Chunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => return SseLine::Malformed(e.to_string()),
    };
    let Some(choice) = chunk.choices.into_iter().next() else {
        return SseLine::Ignore;
    };

    let entries = choice.logprobs.and_then(|l| l.content).unwrap_or_default();
    let tokens: Vec<ParsedToken> = if entries.is_empty() {
        match choice.delta.content {
            Some(text) if !text.is_empty() => vec![ParsedToken {
                text,
                certainty: None,
                alternatives: Vec::new(),
            }],
            _ => Vec::new(),
        }
    } else {
        entries
            .into_iter()
            .map(|entry| ParsedToken {
                certainty: probability(entry.logprob),
                alternatives: entry
                    .top_logprobs
                    .into_iter()
                    .filter(|alt| alt.token != entry.token)
                    .filter_map(|alt| {
                        probability(alt.logprob).map(|p| TokenAlternative {
                            text: alt.token,
                            probability: p,
                        })
                    })
                    .collect(),
                text: entry.token,
            })
            .collect()
    };

    if tokens.is_empty() {
        SseLine::Ignore
    } else {
        SseLine::Tokens(tokens)
    }
}
