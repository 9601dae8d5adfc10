//! Loaded model handles and scoped references to them.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::model_runtime::{Engine, ExecutionTarget, ModelDescriptor, ModelId, TargetKind};
use crate::policy::OptimizationPolicy;

/// Externally visible lifecycle state of a model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Evicting,
    Failed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Evicting => "evicting",
            ModelState::Failed => "failed",
        })
    }
}

struct Lifecycle {
    state: ModelState,
    refs: usize,
    last_used: Instant,
    torn_down: bool,
}

/// One execution target of a loaded model with its concurrency limit.
pub struct Lane {
    pub target: ExecutionTarget,
    pub permits: Arc<Semaphore>,
}

/// A successfully loaded model.
///
/// State and reference count live under one lock, so "evict only at zero
/// references" and "retain only while ready" cannot interleave.
pub struct ModelHandle {
    descriptor: ModelDescriptor,
    policy: OptimizationPolicy,
    engine: Arc<dyn Engine>,
    lanes: Vec<Lane>,
    lifecycle: Mutex<Lifecycle>,
    loaded_at: DateTime<Utc>,
    generation: u64,
}

impl ModelHandle {
    pub(crate) fn new(
        descriptor: ModelDescriptor,
        policy: OptimizationPolicy,
        engine: Arc<dyn Engine>,
        generation: u64,
    ) -> Self {
        let lanes = engine
            .targets()
            .iter()
            .map(|target| Lane {
                target: target.clone(),
                permits: Arc::new(Semaphore::new(target.max_concurrency)),
            })
            .collect();
        Self {
            descriptor,
            policy,
            engine,
            lanes,
            lifecycle: Mutex::new(Lifecycle {
                state: ModelState::Ready,
                refs: 0,
                last_used: Instant::now(),
                torn_down: false,
            }),
            loaded_at: Utc::now(),
            generation,
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn policy(&self) -> &OptimizationPolicy {
        &self.policy
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn lane(&self, kind: TargetKind) -> Option<&Lane> {
        self.lanes.iter().find(|lane| lane.target.kind == kind)
    }

    pub fn footprint_bytes(&self) -> u64 {
        self.policy.memory_reservation_bytes
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Distinguishes successive loads of the same id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ModelState {
        self.lifecycle.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.lifecycle.lock().refs
    }

    pub fn last_used(&self) -> Instant {
        self.lifecycle.lock().last_used
    }

    pub fn is_idle(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.state == ModelState::Ready && lifecycle.refs == 0
    }

    /// Takes a reference if the handle is still ready.
    pub(crate) fn try_retain(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != ModelState::Ready {
            return false;
        }
        lifecycle.refs += 1;
        lifecycle.last_used = Instant::now();
        true
    }

    /// Drops a reference. Returns `true` when the caller must tear the engine
    /// down (last reference of a retired handle).
    fn release(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        debug_assert!(lifecycle.refs > 0, "reference released twice");
        lifecycle.refs = lifecycle.refs.saturating_sub(1);
        lifecycle.last_used = Instant::now();
        Self::claim_teardown(&mut lifecycle)
    }

    /// Ready → Evicting, only with zero references. On success the caller
    /// owns teardown.
    pub(crate) fn try_begin_eviction(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != ModelState::Ready || lifecycle.refs > 0 {
            return false;
        }
        lifecycle.state = ModelState::Evicting;
        lifecycle.torn_down = true;
        true
    }

    /// Holds an idle handle's lifecycle without changing it. Returns `None`
    /// if the handle is busy, retired or locked by another thread.
    pub(crate) fn try_claim_eviction(&self) -> Option<EvictionClaim<'_>> {
        let lifecycle = self.lifecycle.try_lock()?;
        (lifecycle.state == ModelState::Ready && lifecycle.refs == 0).then_some(EvictionClaim { lifecycle })
    }

    /// Moves the handle out of service regardless of references. Returns
    /// `true` when no reference is left and the caller owns teardown;
    /// otherwise the last released reference tears it down.
    pub(crate) fn retire(&self, to: ModelState) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ModelState::Ready {
            lifecycle.state = to;
        }
        Self::claim_teardown(&mut lifecycle)
    }

    fn claim_teardown(lifecycle: &mut Lifecycle) -> bool {
        let retired = matches!(lifecycle.state, ModelState::Evicting | ModelState::Failed);
        if retired && lifecycle.refs == 0 && !lifecycle.torn_down {
            lifecycle.torn_down = true;
            return true;
        }
        false
    }
}

/// An idle handle that cannot be retained while the claim is held. Dropping
/// the claim leaves the handle ready.
pub(crate) struct EvictionClaim<'a> {
    lifecycle: MutexGuard<'a, Lifecycle>,
}

impl EvictionClaim<'_> {
    /// Ready → Evicting; the caller owns teardown.
    pub(crate) fn commit(mut self) {
        self.lifecycle.state = ModelState::Evicting;
        self.lifecycle.torn_down = true;
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.descriptor.id)
            .field("backend", &self.policy.backend)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

/// Shuts the engine down. Failures are logged; the handle is gone either way.
pub(crate) async fn teardown(handle: Arc<ModelHandle>) {
    debug!(model_id = %handle.id(), "Tearing down engine");
    if let Err(e) = handle.engine.shutdown().await {
        warn!(model_id = %handle.id(), "Engine shutdown failed: {:#}", e);
    }
}

/// A counted reference on a ready handle, released on drop.
pub struct ReferenceGuard {
    handle: Arc<ModelHandle>,
}

impl ReferenceGuard {
    /// Caller must already hold the reference taken by `try_retain`.
    pub(crate) fn adopt(handle: Arc<ModelHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }
}

impl fmt::Debug for ReferenceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceGuard")
            .field("model_id", self.handle.id())
            .field("generation", &self.handle.generation)
            .finish()
    }
}

impl std::ops::Deref for ReferenceGuard {
    type Target = ModelHandle;

    fn deref(&self) -> &ModelHandle {
        &self.handle
    }
}

impl Drop for ReferenceGuard {
    fn drop(&mut self) {
        if !self.handle.release() {
            return;
        }
        let handle = Arc::clone(&self.handle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(teardown(handle));
            }
            Err(_) => warn!(
                model_id = %handle.id(),
                "No runtime available, engine teardown skipped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ready_handle, ScriptedEngine};

    #[test]
    fn test_lanes_follow_engine_targets() {
        let handle = ready_handle("m1", 1 << 20, ScriptedEngine::default());
        assert_eq!(handle.lanes().len(), 2);
        let gpu = handle.lane(TargetKind::Gpu).unwrap();
        assert_eq!(gpu.permits.available_permits(), gpu.target.max_concurrency);
        assert!(handle.lane(TargetKind::NeuralAccelerator).is_none());
    }

    #[test]
    fn test_guard_release_on_drop() {
        let handle = ready_handle("m1", 1, ScriptedEngine::default());
        assert!(handle.try_retain());
        let guard = ReferenceGuard::adopt(handle.clone());
        assert_eq!(handle.ref_count(), 1);
        assert!(!handle.is_idle());
        drop(guard);
        assert_eq!(handle.ref_count(), 0);
        assert!(handle.is_idle());
    }

    #[test]
    fn test_guard_debug_names_model() {
        let handle = ready_handle("m1", 1, ScriptedEngine::default());
        assert!(handle.try_retain());
        let guard = ReferenceGuard::adopt(handle.clone());
        let rendered = format!("{:?}", guard);
        assert!(rendered.contains("m1"), "{}", rendered);
        assert!(rendered.contains("generation"), "{}", rendered);
        drop(guard);

        let refused: std::result::Result<ReferenceGuard, &str> = Err("busy");
        assert_eq!(refused.unwrap_err(), "busy");
    }

    #[test]
    fn test_busy_handle_cannot_begin_eviction() {
        let handle = ready_handle("m1", 1, ScriptedEngine::default());
        assert!(handle.try_retain());
        let guard = ReferenceGuard::adopt(handle.clone());
        assert!(!handle.try_begin_eviction());
        drop(guard);
        assert!(handle.try_begin_eviction());
        assert_eq!(handle.state(), ModelState::Evicting);
        assert!(!handle.try_retain());
    }

    #[test]
    fn test_dropped_claim_leaves_handle_ready() {
        let handle = ready_handle("m1", 1, ScriptedEngine::default());
        let claim = handle.try_claim_eviction().unwrap();
        drop(claim);
        assert!(handle.is_idle());
        assert!(handle.try_retain());
        assert!(handle.try_claim_eviction().is_none());
        handle.release();

        handle.try_claim_eviction().unwrap().commit();
        assert_eq!(handle.state(), ModelState::Evicting);
        assert!(!handle.try_retain());
    }

    #[test]
    fn test_guard_survives_panic() {
        let handle = ready_handle("m1", 1, ScriptedEngine::default());
        let inner = handle.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            assert!(inner.try_retain());
            let _guard = ReferenceGuard::adopt(inner);
            panic!("request blew up");
        }));
        assert!(result.is_err());
        assert_eq!(handle.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_retired_handle_torn_down_by_last_reference() {
        let engine = ScriptedEngine::default();
        let shutdowns = engine.shutdown_counter();
        let handle = ready_handle("m1", 1, engine);
        assert!(handle.try_retain());
        let guard = ReferenceGuard::adopt(handle.clone());

        assert!(!handle.retire(ModelState::Failed));
        assert_eq!(handle.state(), ModelState::Failed);
        drop(guard);

        for _ in 0..100 {
            if shutdowns.load(std::sync::atomic::Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
