//! Hardware-adaptive model loading and inference dispatch for local model
//! hosting.
//!
//! An artifact path goes through format detection, a load-time policy
//! derived from the current hardware profile and admission into a
//! memory-budgeted registry. Requests then run prefill, decode and embedding
//! phases on whichever execution target the dispatcher picks.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hardware;
pub mod host;
pub mod inference;
pub mod metrics;
pub mod model_runtime;
pub mod policy;
pub mod registry;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, EvictionReason, LifecycleEvent};
pub use hardware::{HardwareProfile, HardwareProfiler};
pub use host::InferenceHost;
pub use inference::{Completion, InferenceEngine, Token, TokenStream};
pub use model_runtime::{GenerationParams, LoadRequest, ModelFormat, ModelId};
pub use policy::{OptimizationPolicy, PolicyConfig};
pub use registry::{ModelHandle, ModelRegistry, ModelState, ModelSummary};
