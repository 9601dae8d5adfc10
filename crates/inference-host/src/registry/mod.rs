//! Model registry and lifecycle manager.
//!
//! Every model id owns a [`Slot`] whose mutex is the per-id lock: load
//! collapsing, admission and publication all happen under it, so at most one
//! handle (or one in-flight load) exists per id. The registry never locks
//! across ids except through `try_lock` during eviction.
//!
//! Lock order: slot, then ledger, then (non-blocking) victim slots. Handle
//! lifecycle locks are leaves.

pub mod handle;
pub mod ledger;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, EvictionReason, LifecycleEvent};
use crate::model_runtime::{Engine, LoadPlan, ModelDescriptor, ModelFormat, ModelId, Quantization};
use crate::policy::OptimizationPolicy;

pub use handle::{Lane, ModelHandle, ModelState, ReferenceGuard};
pub use ledger::MemoryLedger;

use handle::teardown;
use ledger::{EvictionPlan, Victim};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<ModelHandle>>>>;

pub(crate) enum SlotState {
    Vacant,
    Loading {
        descriptor: ModelDescriptor,
        backend: String,
        outcome: SharedLoad,
    },
    Ready(Arc<ModelHandle>),
}

/// Per-id lock. Slots are never removed from the map, so every caller for an
/// id synchronizes on the same mutex.
pub(crate) struct Slot {
    state: Mutex<SlotState>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState::Vacant),
        }
    }
}

/// Point-in-time view of one registered model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub id: ModelId,
    pub format: ModelFormat,
    pub backend: String,
    pub state: ModelState,
    pub quantization: Option<Quantization>,
    pub ref_count: usize,
    pub footprint_bytes: u64,
    pub loaded_at: Option<DateTime<Utc>>,
}

struct Inner {
    slots: DashMap<ModelId, Arc<Slot>>,
    ledger: Mutex<MemoryLedger>,
    events: EventBus,
    load_executions: AtomicU64,
    generations: AtomicU64,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
}

impl ModelRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                ledger: Mutex::new(MemoryLedger::default()),
                events,
                load_executions: AtomicU64::new(0),
                generations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Loads the planned model, or joins the load already in flight for its id.
    ///
    /// Every caller of one load observes the same outcome. A ready model is
    /// returned as is.
    pub async fn load(&self, plan: LoadPlan) -> Result<Arc<ModelHandle>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::LoadFailed {
                model_id: plan.descriptor.id.to_string(),
                cause: "registry is shut down".into(),
            });
        }

        let id = plan.descriptor.id.clone();
        let slot = self.slot(&id);
        let outcome = {
            let mut state = slot.state.lock();
            match &*state {
                SlotState::Ready(handle) => {
                    debug!(model_id = %id, "Model already loaded");
                    return Ok(Arc::clone(handle));
                }
                SlotState::Loading { outcome, .. } => {
                    debug!(model_id = %id, "Joining in-flight load");
                    outcome.clone()
                }
                SlotState::Vacant => {
                    let victims = self.admit(&id, &slot, &plan.policy)?;
                    let descriptor = plan.descriptor.clone();
                    let backend = plan.policy.backend.clone();
                    let outcome = self.spawn_load(Arc::clone(&slot), plan, victims);
                    *state = SlotState::Loading {
                        descriptor,
                        backend,
                        outcome: outcome.clone(),
                    };
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Takes a scoped reference on a model, waiting for an in-flight load.
    pub async fn acquire(&self, id: &ModelId) -> Result<ReferenceGuard> {
        let slot = self
            .inner
            .slots
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::model_not_found(id.as_str()))?;

        let pending = {
            let state = slot.state.lock();
            match &*state {
                SlotState::Ready(handle) => {
                    return retain(handle).ok_or_else(|| Error::model_not_found(id.as_str()));
                }
                SlotState::Loading { outcome, .. } => outcome.clone(),
                SlotState::Vacant => return Err(Error::model_not_found(id.as_str())),
            }
        };

        match pending.await {
            Ok(handle) => retain(&handle).ok_or_else(|| Error::model_not_found(id.as_str())),
            Err(e) => {
                debug!(model_id = %id, "Awaited load failed: {}", e);
                Err(Error::model_not_found(id.as_str()))
            }
        }
    }

    pub fn state(&self, id: &ModelId) -> ModelState {
        let Some(slot) = self.inner.slots.get(id).map(|e| Arc::clone(e.value())) else {
            return ModelState::Unloaded;
        };
        let state = slot.state.lock();
        match &*state {
            SlotState::Vacant => ModelState::Unloaded,
            SlotState::Loading { .. } => ModelState::Loading,
            SlotState::Ready(handle) => handle.state(),
        }
    }

    /// Loading and ready models, sorted by id.
    pub fn list_models(&self) -> Vec<ModelSummary> {
        let mut summaries: Vec<ModelSummary> = self
            .snapshot()
            .into_iter()
            .filter_map(|(id, slot)| {
                let state = slot.state.lock();
                match &*state {
                    SlotState::Vacant => None,
                    SlotState::Loading {
                        descriptor, backend, ..
                    } => Some(ModelSummary {
                        id,
                        format: descriptor.format,
                        backend: backend.clone(),
                        state: ModelState::Loading,
                        quantization: None,
                        ref_count: 0,
                        footprint_bytes: 0,
                        loaded_at: None,
                    }),
                    SlotState::Ready(handle) => Some(ModelSummary {
                        id,
                        format: handle.descriptor().format,
                        backend: handle.policy().backend.clone(),
                        state: handle.state(),
                        quantization: Some(handle.policy().quantization),
                        ref_count: handle.ref_count(),
                        footprint_bytes: handle.footprint_bytes(),
                        loaded_at: Some(handle.loaded_at()),
                    }),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Evicts an idle model on request.
    pub async fn unload(&self, id: &ModelId) -> Result<()> {
        let slot = self
            .inner
            .slots
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::model_not_found(id.as_str()))?;

        let handle = {
            let mut state = slot.state.lock();
            match &*state {
                SlotState::Vacant => return Err(Error::model_not_found(id.as_str())),
                SlotState::Loading { descriptor, .. } => {
                    return Err(Error::CapacityExceeded {
                        requested: descriptor.size_bytes,
                        reclaimable: 0,
                    })
                }
                SlotState::Ready(handle) => {
                    let handle = Arc::clone(handle);
                    if !handle.try_begin_eviction() {
                        return Err(Error::CapacityExceeded {
                            requested: handle.footprint_bytes(),
                            reclaimable: 0,
                        });
                    }
                    *state = SlotState::Vacant;
                    self.inner.ledger.lock().release(id);
                    handle
                }
            }
        };

        info!(model_id = %id, "Unloading model");
        self.publish_evicted(id, EvictionReason::Explicit);
        teardown(handle).await;
        Ok(())
    }

    /// Takes a handle whose engine reported corrupted state out of service.
    /// In-flight references keep working until released; new callers see the
    /// id as unloaded and may load it again.
    pub fn mark_failed(&self, handle: &Arc<ModelHandle>) {
        let id = handle.id();
        if let Some(slot) = self.inner.slots.get(id).map(|e| Arc::clone(e.value())) {
            let mut state = slot.state.lock();
            if let SlotState::Ready(current) = &*state {
                if current.generation() == handle.generation() {
                    *state = SlotState::Vacant;
                    self.inner.ledger.lock().release(id);
                }
            }
        }
        warn!(model_id = %id, "Engine reported corrupted state, evicting model");
        let teardown_now = handle.retire(ModelState::Failed);
        self.publish_evicted(id, EvictionReason::Corrupted);
        if teardown_now {
            tokio::spawn(teardown(Arc::clone(handle)));
        }
    }

    /// Stops accepting loads and tears down every model. Busy models are torn
    /// down when their last reference is released.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for (id, slot) in self.snapshot() {
            let pending = match &*slot.state.lock() {
                SlotState::Loading { outcome, .. } => Some(outcome.clone()),
                _ => None,
            };
            if let Some(pending) = pending {
                let _ = pending.await;
            }

            let handle = {
                let mut state = slot.state.lock();
                match std::mem::replace(&mut *state, SlotState::Vacant) {
                    SlotState::Ready(handle) => Some(handle),
                    other => {
                        *state = other;
                        None
                    }
                }
            };
            let Some(handle) = handle else { continue };

            self.inner.ledger.lock().release(&id);
            self.publish_evicted(&id, EvictionReason::Shutdown);
            if handle.retire(ModelState::Evicting) {
                teardown(handle).await;
            } else {
                info!(model_id = %id, refs = handle.ref_count(), "Deferring teardown until requests finish");
            }
        }
        info!("Model registry shut down");
    }

    pub fn memory_in_use(&self) -> u64 {
        self.inner.ledger.lock().used()
    }

    /// Budget applied at the most recent admission.
    pub fn budget_bytes(&self) -> u64 {
        self.inner.ledger.lock().budget()
    }

    /// Loader invocations since startup.
    pub fn load_executions(&self) -> u64 {
        self.inner.load_executions.load(Ordering::SeqCst)
    }

    fn slot(&self, id: &ModelId) -> Arc<Slot> {
        if let Some(slot) = self.inner.slots.get(id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.inner.slots.entry(id.clone()).or_default().value())
    }

    fn snapshot(&self) -> Vec<(ModelId, Arc<Slot>)> {
        self.inner
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Reserves memory for `id`, choosing idle victims when the budget is
    /// short. Runs under the slot lock of `id`.
    fn admit(&self, id: &ModelId, slot: &Arc<Slot>, policy: &OptimizationPolicy) -> Result<Vec<Arc<ModelHandle>>> {
        let requested = policy.memory_reservation_bytes;
        let mut ledger = self.inner.ledger.lock();
        ledger.set_budget(policy.budget_bytes);

        let shortfall = (ledger.used() + requested).saturating_sub(ledger.budget());
        let mut evicted = Vec::new();
        if shortfall > 0 {
            let victims = match ledger.plan_eviction(id, shortfall) {
                EvictionPlan::Evict(victims) => victims,
                EvictionPlan::Short { reclaimable } => {
                    return Err(self.capacity_exceeded(id, requested, ledger.free() + reclaimable));
                }
            };

            // Claim every victim before touching any, so a refused admission
            // leaves all of them ready.
            let mut claims = Vec::with_capacity(victims.len());
            let mut claimable = 0;
            for victim in &victims {
                let Some(victim_state) = victim.slot.state.try_lock() else {
                    continue;
                };
                if !matches!(&*victim_state, SlotState::Ready(h) if Arc::ptr_eq(h, &victim.handle)) {
                    continue;
                }
                let Some(claim) = victim.handle.try_claim_eviction() else {
                    continue;
                };
                claimable += victim.bytes;
                claims.push((victim, victim_state, claim));
            }

            if claimable < shortfall {
                let free = ledger.free();
                drop(claims);
                drop(ledger);
                return Err(self.capacity_exceeded(id, requested, free + claimable));
            }

            for (Victim { id: victim_id, handle, bytes, .. }, mut victim_state, claim) in claims {
                claim.commit();
                *victim_state = SlotState::Vacant;
                drop(victim_state);
                ledger.release(victim_id);
                info!(model_id = %victim_id, bytes, "Evicting idle model under memory pressure");
                self.publish_evicted(victim_id, EvictionReason::MemoryPressure);
                evicted.push(Arc::clone(handle));
            }
        }

        ledger.reserve(id.clone(), Arc::clone(slot), requested);
        Ok(evicted)
    }

    fn capacity_exceeded(&self, id: &ModelId, requested: u64, reclaimable: u64) -> Error {
        let err = Error::CapacityExceeded { requested, reclaimable };
        warn!(model_id = %id, "Admission refused: {}", err);
        self.inner.events.publish(LifecycleEvent::LoadFailed {
            model_id: id.clone(),
            code: err.code(),
            cause: err.to_string(),
        });
        err
    }

    /// Runs the loader on its own task so the load completes (and the slot is
    /// settled) even if every caller stops waiting.
    fn spawn_load(&self, slot: Arc<Slot>, plan: LoadPlan, victims: Vec<Arc<ModelHandle>>) -> SharedLoad {
        let inner = Arc::clone(&self.inner);
        let model_id = plan.descriptor.id.clone();
        let task = tokio::spawn(async move {
            for victim in victims {
                teardown(victim).await;
            }

            inner.load_executions.fetch_add(1, Ordering::SeqCst);
            info!(
                model_id = %plan.descriptor.id,
                backend = %plan.policy.backend,
                quantization = %plan.policy.quantization,
                "Loading model"
            );
            let result = AssertUnwindSafe(plan.loader.load(&plan.descriptor, &plan.policy))
                .catch_unwind()
                .await;
            let engine = match result {
                Ok(Ok(engine)) => Ok(engine),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(_) => Err("loader panicked".to_string()),
            };
            inner.finish_load(&slot, plan, engine)
        });

        let id = model_id.to_string();
        async move {
            task.await.unwrap_or_else(|e| {
                Err(Error::LoadFailed {
                    model_id: id,
                    cause: format!("load task aborted: {}", e),
                })
            })
        }
        .boxed()
        .shared()
    }

    fn publish_evicted(&self, id: &ModelId, reason: EvictionReason) {
        self.inner.events.publish(LifecycleEvent::ModelEvicted {
            model_id: id.clone(),
            reason,
        });
    }
}

impl Inner {
    /// Publishes the load outcome atomically under the slot lock.
    fn finish_load(
        &self,
        slot: &Slot,
        plan: LoadPlan,
        engine: std::result::Result<Arc<dyn Engine>, String>,
    ) -> Result<Arc<ModelHandle>> {
        let id = plan.descriptor.id.clone();
        let mut state = slot.state.lock();
        match engine {
            Ok(engine) => {
                let generation = self.generations.fetch_add(1, Ordering::SeqCst);
                let handle = Arc::new(ModelHandle::new(plan.descriptor, plan.policy, engine, generation));
                *state = SlotState::Ready(Arc::clone(&handle));
                self.ledger.lock().commit(Arc::clone(&handle));
                drop(state);

                info!(model_id = %id, backend = %handle.policy().backend, "Model ready");
                self.events.publish(LifecycleEvent::ModelLoaded {
                    model_id: id,
                    backend: handle.policy().backend.clone(),
                    footprint_bytes: handle.footprint_bytes(),
                });
                Ok(handle)
            }
            Err(cause) => {
                *state = SlotState::Vacant;
                self.ledger.lock().release(&id);
                drop(state);

                let err = Error::LoadFailed {
                    model_id: id.to_string(),
                    cause,
                };
                warn!(model_id = %id, "{}", err);
                self.events.publish(LifecycleEvent::LoadFailed {
                    model_id: id,
                    code: err.code(),
                    cause: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

fn retain(handle: &Arc<ModelHandle>) -> Option<ReferenceGuard> {
    handle
        .try_retain()
        .then(|| ReferenceGuard::adopt(Arc::clone(handle)))
}
