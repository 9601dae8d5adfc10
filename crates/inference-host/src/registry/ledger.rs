//! Memory accounting for loaded and loading models.

use std::collections::HashMap;
use std::sync::Arc;

use super::handle::ModelHandle;
use super::Slot;
use crate::model_runtime::ModelId;

struct Entry {
    slot: Arc<Slot>,
    /// `None` while the load is still running.
    handle: Option<Arc<ModelHandle>>,
    bytes: u64,
}

/// An idle model chosen to make room.
pub(crate) struct Victim {
    pub id: ModelId,
    pub slot: Arc<Slot>,
    pub handle: Arc<ModelHandle>,
    pub bytes: u64,
}

/// Outcome of an eviction search.
pub(crate) enum EvictionPlan {
    /// Least recently used idle models whose release covers the shortfall.
    Evict(Vec<Victim>),
    /// Not enough idle memory; nothing should be evicted.
    Short { reclaimable: u64 },
}

#[derive(Default)]
pub struct MemoryLedger {
    budget: u64,
    entries: HashMap<ModelId, Entry>,
}

impl MemoryLedger {
    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub(crate) fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    /// Bytes held by ready models plus in-flight reservations.
    pub fn used(&self) -> u64 {
        self.entries.values().map(|e| e.bytes).sum()
    }

    pub fn free(&self) -> u64 {
        self.budget.saturating_sub(self.used())
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn reserve(&mut self, id: ModelId, slot: Arc<Slot>, bytes: u64) {
        self.entries.insert(
            id,
            Entry {
                slot,
                handle: None,
                bytes,
            },
        );
    }

    pub(crate) fn commit(&mut self, handle: Arc<ModelHandle>) {
        if let Some(entry) = self.entries.get_mut(handle.id()) {
            entry.bytes = handle.footprint_bytes();
            entry.handle = Some(handle);
        }
    }

    pub(crate) fn release(&mut self, id: &ModelId) -> Option<u64> {
        self.entries.remove(id).map(|e| e.bytes)
    }

    /// Picks idle models, least recently used first, until `shortfall` bytes
    /// would be released. `exclude` is never picked.
    pub(crate) fn plan_eviction(&self, exclude: &ModelId, shortfall: u64) -> EvictionPlan {
        let mut idle: Vec<(&ModelId, &Entry, &Arc<ModelHandle>)> = self
            .entries
            .iter()
            .filter(|(id, _)| *id != exclude)
            .filter_map(|(id, entry)| entry.handle.as_ref().map(|h| (id, entry, h)))
            .filter(|(_, _, handle)| handle.is_idle())
            .collect();

        let reclaimable: u64 = idle.iter().map(|(_, entry, _)| entry.bytes).sum();
        if reclaimable < shortfall {
            return EvictionPlan::Short { reclaimable };
        }

        idle.sort_by(|a, b| a.2.last_used().cmp(&b.2.last_used()).then_with(|| a.0.cmp(b.0)));
        let mut freed = 0;
        let mut victims = Vec::new();
        for (id, entry, handle) in idle {
            if freed >= shortfall {
                break;
            }
            freed += entry.bytes;
            victims.push(Victim {
                id: id.clone(),
                slot: Arc::clone(&entry.slot),
                handle: Arc::clone(handle),
                bytes: entry.bytes,
            });
        }
        EvictionPlan::Evict(victims)
    }
}
