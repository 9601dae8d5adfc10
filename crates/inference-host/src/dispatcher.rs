//! Compute dispatcher: routes each phase of a session to an execution target.
//!
//! Ranking per phase:
//! - prefill is compute bound: GPU, neural accelerator, CPU (accelerator
//!   first when the GPU is thermally throttled)
//! - decode is bandwidth bound: GPU, CPU, accelerator; small models decode
//!   on the CPU first
//! - embedding is latency bound: accelerator, CPU, GPU for short inputs;
//!   GPU first for long ones
//!
//! A saturated target falls through to the next one. When every target is
//! saturated the session waits on the top-ranked one.

use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::hardware::{HardwareProfile, HardwareProfiler};
use crate::inference::InferenceSession;
use crate::model_runtime::{Phase, TargetKind};
use crate::registry::ModelHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchConfig {
    /// Models at or below this footprint decode on the CPU first.
    pub small_model_bytes: u64,
    /// Embedding inputs at or below this length prefer the lowest-latency path.
    pub small_embed_input_chars: usize,
    /// Thermal headroom (percent) below which prefill demotes the GPU.
    pub thermal_throttle_headroom: u8,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            small_model_bytes: 1024 * 1024 * 1024,
            small_embed_input_chars: 512,
            thermal_throttle_headroom: 20,
        }
    }
}

/// A phase's execution slot; the permit is held until the phase completes.
#[derive(Debug)]
pub struct Dispatch {
    pub target: TargetKind,
    pub permit: OwnedSemaphorePermit,
}

pub struct Dispatcher {
    config: DispatchConfig,
    profiler: Arc<HardwareProfiler>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, profiler: Arc<HardwareProfiler>, events: EventBus) -> Self {
        Self {
            config,
            profiler,
            events,
        }
    }

    /// Targets able to run `phase` for this handle on this host, best first.
    pub fn rank(
        &self,
        phase: Phase,
        handle: &ModelHandle,
        profile: &HardwareProfile,
        input_chars: usize,
    ) -> Vec<TargetKind> {
        use TargetKind::*;

        let preference = if handle.policy().cpu_only {
            vec![Cpu]
        } else {
            match phase {
                Phase::Prefill if profile.thermal_headroom < self.config.thermal_throttle_headroom => {
                    vec![NeuralAccelerator, Gpu, Cpu]
                }
                Phase::Prefill => vec![Gpu, NeuralAccelerator, Cpu],
                Phase::Decode if handle.footprint_bytes() <= self.config.small_model_bytes => {
                    vec![Cpu, Gpu, NeuralAccelerator]
                }
                Phase::Decode => vec![Gpu, Cpu, NeuralAccelerator],
                Phase::Embedding if input_chars <= self.config.small_embed_input_chars => {
                    vec![NeuralAccelerator, Cpu, Gpu]
                }
                Phase::Embedding => vec![Gpu, NeuralAccelerator, Cpu],
            }
        };

        preference
            .into_iter()
            .filter(|kind| profile.supports(*kind))
            .filter(|kind| handle.lane(*kind).map_or(false, |lane| lane.target.supports(phase)))
            .collect()
    }

    /// Picks the target for the session's current phase and takes a slot on it.
    pub async fn dispatch(&self, handle: &ModelHandle, session: &InferenceSession) -> Result<Dispatch> {
        let phase = session.phase();
        let profile = self.profiler.current();
        let ranked = self.rank(phase, handle, &profile, session.input_chars());
        let Some(&preferred) = ranked.first() else {
            return Err(Error::no_backend(format!(
                "{} has no execution target for {} on this host",
                handle.policy().backend,
                phase
            )));
        };

        let mut chosen = None;
        for kind in &ranked {
            if let Some(lane) = handle.lane(*kind) {
                if let Ok(permit) = Arc::clone(&lane.permits).try_acquire_owned() {
                    chosen = Some(Dispatch { target: *kind, permit });
                    break;
                }
            }
            debug!(model_id = %handle.id(), %phase, target = %kind, "Target saturated, trying next");
        }

        let dispatch = match chosen {
            Some(dispatch) => dispatch,
            None => {
                let lane = handle
                    .lane(preferred)
                    .ok_or_else(|| Error::no_backend(format!("{} lane missing", preferred)))?;
                let permit = Arc::clone(&lane.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::no_backend(format!("{} lane closed", preferred)))?;
                Dispatch {
                    target: preferred,
                    permit,
                }
            }
        };

        debug!(
            model_id = %handle.id(),
            session = %session.id(),
            %phase,
            target = %dispatch.target,
            "Phase dispatched"
        );
        self.events.publish(LifecycleEvent::PhaseDispatched {
            model_id: handle.id().clone(),
            backend: handle.policy().backend.clone(),
            phase,
            target: dispatch.target,
        });
        Ok(dispatch)
    }
}
