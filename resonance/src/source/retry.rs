//! Starting a stream against a backend that may briefly be unreachable.
//!
//! Only `Retryable` errors (`BackendUnavailable`) earn another attempt.
//! Delays double per attempt up to a ceiling, and part of each delay is
//! spread by stream id so the members of one ensemble do not all hit a
//! recovering backend on the same tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{check_health, StreamHandle, TokenSource};
use crate::error::{EngineError, EngineResult};
use crate::types::{ModelId, StreamId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Start attempts allowed after the first one fails.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Share of each delay, in `[0, 1]`, that varies per stream.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    /// How long to wait after `failed` unsuccessful starts (1-based) ended
    /// in `error`. `None` means give up.
    pub fn delay_after(
        &self,
        error: &EngineError,
        failed: u32,
        stream_id: StreamId,
    ) -> Option<Duration> {
        if !error.is_retryable() || failed == 0 || failed > self.attempts {
            return None;
        }
        let doublings = (failed - 1).min(32);
        let ceiling = self
            .base_delay_ms
            .saturating_mul(1u64 << doublings)
            .min(self.max_delay_ms);
        let spread = (ceiling as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        let offset = match spread {
            0 => 0,
            s => scatter(stream_id.0, failed) % (s + 1),
        };
        Some(Duration::from_millis(ceiling - spread + offset))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            jitter: 0.2,
        }
    }
}

/// splitmix64 finalizer over (stream, attempt).
fn scatter(stream: u64, failed: u32) -> u64 {
    let mut z = stream
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(u64::from(failed));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Health-check the backend, then start a stream.
///
/// Each `start` call is bounded by `start_timeout`; a backend that accepts
/// the request and never answers fails the stream with `StreamTimeout`.
pub async fn start_with_retry(
    source: &dyn TokenSource,
    stream_id: StreamId,
    model_id: &ModelId,
    prompt: &str,
    policy: &RetryPolicy,
    health_timeout: Duration,
    start_timeout: Duration,
) -> EngineResult<StreamHandle> {
    let mut failed: u32 = 0;
    loop {
        let result = match check_health(source, health_timeout).await {
            Ok(()) => {
                let start = source.start(stream_id, model_id, prompt);
                match timeout(start_timeout, start).await {
                    Ok(res) => res,
                    Err(_) => Err(EngineError::StreamTimeout {
                        stream_id,
                        timeout_ms: start_timeout.as_millis() as u64,
                    }),
                }
            }
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(handle) => {
                if failed > 0 {
                    debug!(%stream_id, model = %model_id, attempts = failed + 1, "Stream started after retry");
                }
                return Ok(handle);
            }
            Err(e) => e,
        };

        failed += 1;
        let Some(delay) = policy.delay_after(&err, failed, stream_id) else {
            return Err(err);
        };
        warn!(
            %stream_id,
            model = %model_id,
            attempt = failed,
            delay_ms = delay.as_millis() as u64,
            "Backend unavailable, retrying: {}",
            err
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> EngineError {
        EngineError::BackendUnavailable("down".into())
    }

    #[test]
    fn test_delays_double_then_cap_without_jitter() {
        let policy = RetryPolicy {
            attempts: 10,
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let ms = |n| {
            policy
                .delay_after(&unavailable(), n, StreamId(1))
                .map(|d| d.as_millis() as u64)
        };
        assert_eq!(ms(1), Some(250));
        assert_eq!(ms(2), Some(500));
        assert_eq!(ms(3), Some(1_000));
        assert_eq!(ms(6), Some(4_000));
        assert_eq!(ms(10), Some(4_000));
        assert_eq!(ms(11), None);
    }

    #[test]
    fn test_only_transient_errors_are_retried() {
        let policy = RetryPolicy::default();
        let load = EngineError::load_failed(&ModelId::new("m"), "gone");
        let timeout = EngineError::StreamTimeout {
            stream_id: StreamId(1),
            timeout_ms: 10,
        };
        assert!(policy.delay_after(&load, 1, StreamId(1)).is_none());
        assert!(policy.delay_after(&timeout, 1, StreamId(1)).is_none());
        assert!(RetryPolicy::none()
            .delay_after(&unavailable(), 1, StreamId(1))
            .is_none());
    }

    #[test]
    fn test_jitter_stays_inside_band_and_spreads_streams() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..32)
            .map(|s| {
                policy
                    .delay_after(&unavailable(), 2, StreamId(s))
                    .map(|d| d.as_millis() as u64)
                    .unwrap()
            })
            .collect();
        // 500ms ceiling, 20% of it varies
        assert!(delays.iter().all(|d| (400..=500).contains(d)));
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first));

        // Same stream and attempt always waits the same.
        assert_eq!(
            policy.delay_after(&unavailable(), 2, StreamId(7)),
            policy.delay_after(&unavailable(), 2, StreamId(7))
        );
    }
}
