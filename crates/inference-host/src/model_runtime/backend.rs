//! Capability-set interface every compute backend implements.
//!
//! The loader factory, policy engine and dispatcher only ever see these
//! traits; concrete backends stay opaque behind them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::descriptor::ModelDescriptor;
use super::format::ModelFormat;
use crate::policy::OptimizationPolicy;

/// Class of hardware an execution path runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Cpu,
    Gpu,
    NeuralAccelerator,
}

impl TargetKind {
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, TargetKind::Cpu)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetKind::Cpu => "cpu",
            TargetKind::Gpu => "gpu",
            TargetKind::NeuralAccelerator => "neural_accelerator",
        })
    }
}

/// Sub-stage of an inference request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prefill,
    Decode,
    Embedding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Prefill => "prefill",
            Phase::Decode => "decode",
            Phase::Embedding => "embedding",
        })
    }
}

/// One execution path a backend (or a loaded engine) exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTarget {
    pub kind: TargetKind,
    pub phases: Vec<Phase>,
    /// Sessions the path runs concurrently before it counts as saturated.
    pub max_concurrency: usize,
}

impl ExecutionTarget {
    /// A path that serves every phase.
    pub fn new(kind: TargetKind, max_concurrency: usize) -> Self {
        Self {
            kind,
            phases: vec![Phase::Prefill, Phase::Decode, Phase::Embedding],
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn with_phases(mut self, phases: &[Phase]) -> Self {
        self.phases = phases.to_vec();
        self
    }

    pub fn supports(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Static facts about a backend, consumed by the policy engine.
#[derive(Debug, Clone)]
pub struct BackendCapabilities {
    pub name: String,
    pub formats: Vec<ModelFormat>,
    pub targets: Vec<ExecutionTarget>,
    /// Upper bound on worker threads the backend makes use of.
    pub thread_cap: u32,
}

impl BackendCapabilities {
    pub fn loadable(&self, format: ModelFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn supports(&self, phase: Phase) -> bool {
        self.targets.iter().any(|t| t.supports(phase))
    }

    pub fn has_target(&self, kind: TargetKind) -> bool {
        self.targets.iter().any(|t| t.kind == kind)
    }

    pub fn is_accelerated(&self) -> bool {
        self.targets.iter().any(|t| t.kind.is_accelerated())
    }
}

/// Sampling knobs forwarded untouched to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> u32 { 2000 }
fn default_temperature() -> f32 { 0.7 }
fn default_top_p() -> f32 { 0.95 }

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            stop: Vec::new(),
            seed: None,
        }
    }
}

/// Result of prompt processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefillOutcome {
    pub prompt_tokens: u32,
}

/// Failure reported by an engine call.
#[derive(Debug, Error)]
pub enum EngineFault {
    /// The request failed; the loaded model is still usable.
    #[error("{0:#}")]
    Failed(anyhow::Error),
    /// The engine reports its loaded state as unusable.
    #[error("engine state corrupted: {0:#}")]
    Corrupted(anyhow::Error),
}

impl EngineFault {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, EngineFault::Corrupted(_))
    }
}

impl From<anyhow::Error> for EngineFault {
    fn from(err: anyhow::Error) -> Self {
        EngineFault::Failed(err)
    }
}

/// Token texts produced by a decode call, in order.
pub type EngineTokens = BoxStream<'static, Result<String, EngineFault>>;

/// A model opened by a backend.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Execution paths this loaded model can run on.
    fn targets(&self) -> &[ExecutionTarget];

    /// Embedding width declared at load, if the model produces embeddings.
    fn embedding_dimension(&self) -> Option<usize>;

    async fn prefill(
        &self,
        target: TargetKind,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<PrefillOutcome, EngineFault>;

    /// Starts token generation following a prefill of the same prompt.
    async fn decode(
        &self,
        target: TargetKind,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<EngineTokens, EngineFault>;

    async fn embed(&self, target: TargetKind, text: &str) -> Result<Vec<f32>, EngineFault>;

    /// Releases backend resources. Called once, after the last reference is gone.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// A compute backend able to open models of one or more formats.
#[async_trait]
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> &BackendCapabilities;

    fn name(&self) -> &str {
        &self.capabilities().name
    }

    fn loadable(&self, format: ModelFormat) -> bool {
        self.capabilities().loadable(format)
    }

    fn supports(&self, phase: Phase) -> bool {
        self.capabilities().supports(phase)
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        policy: &OptimizationPolicy,
    ) -> anyhow::Result<Arc<dyn Engine>>;
}
