//! Tier-bounded model pool with LRU eviction.
//!
//! The pool owns every [`ModelHandle`]. Callers get copies; all bookkeeping
//! (load, pin, release, evict) goes through the pool, serialized by one
//! async mutex so the LRU order never races. The lock is held across the
//! backend load so two callers cannot both decide to fill the last slot;
//! every backend call under it is bounded by `load_timeout`.
//!
//! A handle is *pinned* while any ensemble run uses it. Only unpinned
//! handles are eviction candidates. A model evicted less than
//! `reload_cooldown` ago is refused with `ModelCoolingDown`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, TierPolicy};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EvictionReason, SharedEventBus};
use crate::source::TokenSource;
use crate::types::ModelId;

/// One loaded backend model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHandle {
    pub model_id: ModelId,
    pub loaded_at: Instant,
    pub last_used_at: Instant,
    pub memory_estimate: u64,
}

#[derive(Debug)]
struct Slot {
    handle: ModelHandle,
    pins: usize,
    /// Tie-breaker for equal `last_used_at` (coarse or paused clocks).
    use_seq: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: HashMap<ModelId, Slot>,
    evicted_at: HashMap<ModelId, Instant>,
    use_seq: u64,
}

impl PoolState {
    fn next_seq(&mut self) -> u64 {
        self.use_seq += 1;
        self.use_seq
    }

    fn pinned(&self) -> usize {
        self.slots.values().filter(|s| s.pins > 0).count()
    }

    /// Up to `n` unpinned models, least recently used first.
    fn lru_victims(&self, n: usize) -> Vec<ModelId> {
        let mut idle: Vec<&Slot> = self.slots.values().filter(|s| s.pins == 0).collect();
        idle.sort_by_key(|s| (s.handle.last_used_at, s.use_seq));
        idle.into_iter()
            .take(n)
            .map(|s| s.handle.model_id.clone())
            .collect()
    }
}

/// Result of [`ModelPool::acquire_for_ensemble`].
#[derive(Debug, Default)]
pub struct Acquisition {
    /// Pinned handles in caller priority order.
    pub handles: Vec<ModelHandle>,
    /// Requested models dropped by the parallelism limit.
    pub truncated: Vec<ModelId>,
    /// Models inside the limit that could not be loaded.
    pub failures: Vec<(ModelId, EngineError)>,
}

impl Acquisition {
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

pub struct ModelPool {
    source: Arc<dyn TokenSource>,
    tier: TierPolicy,
    config: PoolConfig,
    bus: Option<SharedEventBus>,
    state: Mutex<PoolState>,
}

impl ModelPool {
    pub fn new(source: Arc<dyn TokenSource>, tier: TierPolicy, config: PoolConfig) -> Self {
        Self {
            source,
            tier,
            config,
            bus: None,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn tier(&self) -> &TierPolicy {
        &self.tier
    }

    /// Best-effort unload, bounded like a load.
    async fn unload(&self, model_id: &ModelId) {
        let bound = self.config.load_timeout();
        if timeout(bound, self.source.unload_model(model_id)).await.is_err() {
            warn!(model = %model_id, timeout_ms = bound.as_millis() as u64, "Model unload timed out");
        }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    /// Return a pinned handle for `model_id`, loading it if needed.
    ///
    /// Loading may evict least-recently-used unpinned handles, but only
    /// after the new model is in.
    /// Fails with `CapacityExceeded` when every slot is pinned and with
    /// `ModelCoolingDown` inside the reload cooldown.
    pub async fn ensure_loaded(&self, model_id: &ModelId) -> EngineResult<ModelHandle> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let seq = state.next_seq();

        if let Some(slot) = state.slots.get_mut(model_id) {
            slot.pins += 1;
            slot.handle.last_used_at = now;
            slot.use_seq = seq;
            debug!(model = %model_id, pins = slot.pins, "Model already loaded");
            return Ok(slot.handle.clone());
        }

        let cooldown = self.config.reload_cooldown();
        if let Some(&evicted) = state.evicted_at.get(model_id) {
            let since = now.saturating_duration_since(evicted);
            if since < cooldown {
                let remaining_ms = (cooldown - since).as_millis() as u64;
                info!(model = %model_id, remaining_ms, "Reload refused during cooldown");
                return Err(EngineError::ModelCoolingDown {
                    model_id: model_id.clone(),
                    remaining_ms,
                });
            }
            state.evicted_at.remove(model_id);
        }

        // Victims are chosen up front but only evicted once the new model
        // has loaded, so a failed load costs nothing.
        let limit = self.tier.max_loaded_models;
        let excess = (state.slots.len() + 1).saturating_sub(limit);
        let victims = state.lru_victims(excess);
        if victims.len() < excess {
            let err = EngineError::CapacityExceeded {
                loaded: state.slots.len(),
                pinned: state.pinned(),
                limit,
            };
            warn!(model = %model_id, "{}", err);
            return Err(err);
        }

        let started = Instant::now();
        let load_timeout = self.config.load_timeout();
        let footprint = match timeout(load_timeout, self.source.load_model(model_id)).await {
            Ok(Ok(f)) => f,
            Ok(Err(e)) => {
                warn!(model = %model_id, "Model load failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                let err = EngineError::load_failed(
                    model_id,
                    format!("backend did not load it within {}ms", load_timeout.as_millis()),
                );
                warn!(model = %model_id, "{}", err);
                return Err(err);
            }
        };
        let load_time_ms = started.elapsed().as_millis() as u64;

        let evicted_at = Instant::now();
        for victim in victims {
            state.slots.remove(&victim);
            state.evicted_at.insert(victim.clone(), evicted_at);
            info!(model = %victim, for_model = %model_id, "Evicting least-recently-used model");
            self.unload(&victim).await;
            self.publish(EngineEvent::ModelEvicted {
                model_id: victim,
                reason: EvictionReason::Lru,
                timestamp: Utc::now(),
            });
        }

        let loaded_at = Instant::now();
        let handle = ModelHandle {
            model_id: model_id.clone(),
            loaded_at,
            last_used_at: loaded_at,
            memory_estimate: footprint.memory_estimate,
        };
        state.slots.insert(
            model_id.clone(),
            Slot {
                handle: handle.clone(),
                pins: 1,
                use_seq: seq,
            },
        );
        info!(
            model = %model_id,
            load_time_ms,
            loaded = state.slots.len(),
            limit,
            "Model loaded"
        );
        self.publish(EngineEvent::ModelLoaded {
            model_id: model_id.clone(),
            load_time_ms,
            memory_estimate: footprint.memory_estimate,
            timestamp: Utc::now(),
        });
        Ok(handle)
    }

    /// Pin handles for one ensemble run.
    ///
    /// The request is cut to `max_parallel_models` in caller order first;
    /// models that then fail to load are reported, not replaced by the
    /// truncated tail. Never fails as a whole.
    pub async fn acquire_for_ensemble(&self, model_ids: &[ModelId]) -> Acquisition {
        let limit = self.tier.max_parallel_models;
        let (selected, rest) = model_ids.split_at(model_ids.len().min(limit));

        let mut acquisition = Acquisition {
            truncated: rest.to_vec(),
            ..Acquisition::default()
        };
        if !rest.is_empty() {
            info!(
                requested = model_ids.len(),
                limit,
                dropped = rest.len(),
                "Ensemble request truncated to tier parallelism"
            );
        }

        for model_id in selected {
            match self.ensure_loaded(model_id).await {
                Ok(handle) => acquisition.handles.push(handle),
                Err(e) => acquisition.failures.push((model_id.clone(), e)),
            }
        }
        acquisition
    }

    /// Unpin `handle`, making it eligible for eviction once no run uses it.
    pub async fn release(&self, handle: &ModelHandle) {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        if let Some(slot) = state.slots.get_mut(&handle.model_id) {
            slot.pins = slot.pins.saturating_sub(1);
            slot.handle.last_used_at = Instant::now();
            slot.use_seq = seq;
            debug!(model = %handle.model_id, pins = slot.pins, "Model released");
        }
    }

    pub async fn is_loaded(&self, model_id: &ModelId) -> bool {
        self.state.lock().await.slots.contains_key(model_id)
    }

    /// Loaded handles, least recently used first.
    pub async fn loaded(&self) -> Vec<ModelHandle> {
        let state = self.state.lock().await;
        let mut slots: Vec<&Slot> = state.slots.values().collect();
        slots.sort_by_key(|s| (s.handle.last_used_at, s.use_seq));
        slots.into_iter().map(|s| s.handle.clone()).collect()
    }

    pub async fn pinned_count(&self) -> usize {
        self.state.lock().await.pinned()
    }

    /// Unload everything. Pinned handles are dropped too.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let models: Vec<ModelId> = state.slots.drain().map(|(id, _)| id).collect();
        state.evicted_at.clear();
        drop(state);

        for model_id in models {
            self.unload(&model_id).await;
            self.publish(EngineEvent::ModelEvicted {
                model_id,
                reason: EvictionReason::Shutdown,
                timestamp: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Script, ScriptedSource};
    use std::time::Duration;

    fn source(models: &[&str]) -> Arc<ScriptedSource> {
        let mut s = ScriptedSource::new();
        for m in models {
            s = s.with_script(*m, Script::new());
        }
        Arc::new(s)
    }

    fn pool(source: Arc<ScriptedSource>, parallel: usize, loaded: usize, cooldown_ms: u64) -> ModelPool {
        let tier = TierPolicy {
            max_parallel_models: parallel,
            max_loaded_models: loaded,
            ..TierPolicy::default()
        };
        ModelPool::new(
            source,
            tier,
            PoolConfig {
                reload_cooldown_ms: cooldown_ms,
                ..PoolConfig::default()
            },
        )
    }

    fn id(s: &str) -> ModelId {
        ModelId::new(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_loaded_handle() {
        let src = source(&["a"]);
        let pool = pool(src.clone(), 2, 2, 0);
        let h1 = pool.ensure_loaded(&id("a")).await.unwrap();
        let h2 = pool.ensure_loaded(&id("a")).await.unwrap();
        assert_eq!(h1.model_id, h2.model_id);
        assert_eq!(src.load_count(), 1);
        assert_eq!(pool.pinned_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_recently_used() {
        let src = source(&["a", "b", "c"]);
        let pool = pool(src.clone(), 2, 2, 0);

        let a = pool.ensure_loaded(&id("a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        let b = pool.ensure_loaded(&id("b")).await.unwrap();
        pool.release(&b).await;
        tokio::time::advance(Duration::from_millis(5)).await;
        pool.release(&a).await;

        // b was used longest ago
        pool.ensure_loaded(&id("c")).await.unwrap();
        assert!(pool.is_loaded(&id("a")).await);
        assert!(!pool.is_loaded(&id("b")).await);
        assert_eq!(src.unload_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_evicts_pinned() {
        let src = source(&["a", "b", "c"]);
        let pool = pool(src, 2, 2, 0);
        let _a = pool.ensure_loaded(&id("a")).await.unwrap();
        let _b = pool.ensure_loaded(&id("b")).await.unwrap();

        let err = pool.ensure_loaded(&id("c")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded {
                loaded: 2,
                pinned: 2,
                limit: 2
            }
        ));
        assert!(pool.is_loaded(&id("a")).await);
        assert!(pool.is_loaded(&id("b")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_cooldown() {
        let src = source(&["a", "b"]);
        let pool = pool(src, 1, 1, 1_000);

        let a = pool.ensure_loaded(&id("a")).await.unwrap();
        pool.release(&a).await;
        let b = pool.ensure_loaded(&id("b")).await.unwrap();
        pool.release(&b).await;

        let err = pool.ensure_loaded(&id("a")).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelCoolingDown { .. }));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(pool.ensure_loaded(&id("a")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_keeps_eviction_candidate() {
        let src = Arc::new(
            ScriptedSource::new()
                .with_script("a", Script::new())
                .with_script("bad", Script::new())
                .fail_loading("bad"),
        );
        let pool = pool(src.clone(), 1, 1, 1_000);

        let a = pool.ensure_loaded(&id("a")).await.unwrap();
        pool.release(&a).await;
        assert!(pool.ensure_loaded(&id("bad")).await.is_err());

        assert!(pool.is_loaded(&id("a")).await);
        assert_eq!(src.unload_count(), 0);
        // No cooldown was started for a model that never left.
        assert!(pool.ensure_loaded(&id("a")).await.is_ok());
        assert_eq!(src.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_load_times_out_and_frees_the_pool() {
        let src = Arc::new(
            ScriptedSource::new()
                .with_script("a", Script::new())
                .with_script("slow", Script::new())
                .stall_loading("slow"),
        );
        let pool = Arc::new(ModelPool::new(
            src,
            TierPolicy {
                max_parallel_models: 2,
                max_loaded_models: 2,
                ..TierPolicy::default()
            },
            PoolConfig {
                reload_cooldown_ms: 0,
                load_timeout_ms: 500,
            },
        ));
        let a = pool.ensure_loaded(&id("a")).await.unwrap();

        let stalled = tokio::spawn({
            let pool = pool.clone();
            async move { pool.ensure_loaded(&id("slow")).await }
        });
        tokio::task::yield_now().await;
        // Release waits behind the stalled load, but only up to the bound.
        let released = Instant::now();
        pool.release(&a).await;
        assert!(released.elapsed() <= Duration::from_millis(500));

        let err = stalled.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::ModelLoadFailed { .. }));
        assert!(!pool.is_loaded(&id("slow")).await);
        assert_eq!(pool.pinned_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_truncates_in_order() {
        let src = source(&["a", "b", "c", "d"]);
        let pool = pool(src, 2, 4, 0);
        let ids: Vec<ModelId> = ["a", "b", "c", "d"].into_iter().map(id).collect();

        let acq = pool.acquire_for_ensemble(&ids).await;
        let got: Vec<&str> = acq.handles.iter().map(|h| h.model_id.as_str()).collect();
        assert_eq!(got, vec!["a", "b"]);
        assert_eq!(acq.truncated, vec![id("c"), id("d")]);
        assert!(acq.failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reports_failures_without_backfill() {
        let src = Arc::new(
            ScriptedSource::new()
                .with_script("a", Script::new())
                .with_script("b", Script::new())
                .with_script("c", Script::new())
                .fail_loading("a"),
        );
        let pool = pool(src, 2, 4, 0);
        let acq = pool
            .acquire_for_ensemble(&[id("a"), id("b"), id("c")])
            .await;
        assert_eq!(acq.handles.len(), 1);
        assert_eq!(acq.handles[0].model_id, id("b"));
        assert_eq!(acq.failures.len(), 1);
        assert_eq!(acq.truncated, vec![id("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unloads_all() {
        let src = source(&["a", "b"]);
        let pool = pool(src.clone(), 2, 2, 0);
        pool.ensure_loaded(&id("a")).await.unwrap();
        pool.ensure_loaded(&id("b")).await.unwrap();
        pool.shutdown().await;
        assert!(pool.loaded().await.is_empty());
        assert_eq!(src.unload_count(), 2);
    }
}
