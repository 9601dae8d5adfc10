//! Model runtime layer.
//!
//! Artifacts are classified by [`FormatDetector`], described and planned by
//! [`LoaderFactory`], then opened by a [`Backend`] into an [`Engine`]. Every
//! backend speaks the same capability-set interface, so nothing above this
//! layer branches on model format.

pub mod backend;
pub mod descriptor;
pub mod format;
pub mod format_detector;
pub mod loader;
pub mod quantization;
pub mod server_backend;

pub use backend::{
    Backend, BackendCapabilities, Engine, EngineFault, EngineTokens, ExecutionTarget, GenerationParams, Phase,
    PrefillOutcome, TargetKind,
};
pub use descriptor::{ModelDescriptor, ModelId};
pub use format::ModelFormat;
pub use format_detector::{Detection, FormatDetector, Specificity};
pub use loader::{LoadPlan, LoadRequest, Loader, LoaderFactory};
pub use quantization::Quantization;
pub use server_backend::{PortAllocator, ServerBackend, ServerEngine, ServerFlavor, ServerSettings};
