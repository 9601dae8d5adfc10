//! Loader factory: turns a load request into a descriptor, a policy and the
//! loader that will open the model. Nothing here loads anything.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{Backend, Engine};
use super::descriptor::{ModelDescriptor, ModelId};
use super::format::ModelFormat;
use super::format_detector::{artifact_size, FormatDetector};
use crate::error::{Error, Result};
use crate::hardware::HardwareProfiler;
use crate::policy::{OptimizationPolicy, PolicyConfig, PolicyEngine};

/// What the caller knows about an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub model_id: Option<ModelId>,
    /// Preferred format when the artifact matches more than one.
    pub format: Option<ModelFormat>,
    pub parameter_count: Option<u64>,
}

impl LoadRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            model_id: None,
            format: None,
            parameter_count: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<ModelId>) -> Self {
        self.model_id = Some(id.into());
        self
    }

    pub fn with_format(mut self, format: ModelFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_parameter_count(mut self, parameters: u64) -> Self {
        self.parameter_count = Some(parameters);
        self
    }
}

/// Opens models through one backend.
#[derive(Clone)]
pub struct Loader {
    backend: Arc<dyn Backend>,
}

impl Loader {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn load(
        &self,
        descriptor: &ModelDescriptor,
        policy: &OptimizationPolicy,
    ) -> anyhow::Result<Arc<dyn Engine>> {
        self.backend.load(descriptor, policy).await
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader").field("backend", &self.backend_name()).finish()
    }
}

/// Everything the registry needs to run one load.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub descriptor: ModelDescriptor,
    pub policy: OptimizationPolicy,
    pub loader: Loader,
}

pub struct LoaderFactory {
    backends: Vec<Arc<dyn Backend>>,
    policy: PolicyEngine,
    profiler: Arc<HardwareProfiler>,
}

impl LoaderFactory {
    /// `backends` in preference order.
    pub fn new(backends: Vec<Arc<dyn Backend>>, config: PolicyConfig, profiler: Arc<HardwareProfiler>) -> Self {
        let capabilities = backends.iter().map(|b| b.capabilities().clone()).collect();
        Self {
            backends,
            policy: PolicyEngine::new(config, capabilities),
            profiler,
        }
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Loader for the first backend able to open `format`.
    pub fn loader_for(&self, format: ModelFormat) -> Option<Loader> {
        self.backends
            .iter()
            .find(|b| b.loadable(format))
            .map(|b| Loader::new(Arc::clone(b)))
    }

    /// Classifies the artifact and fills in its static facts.
    pub fn describe(&self, request: &LoadRequest) -> Result<ModelDescriptor> {
        let detection = FormatDetector::detect(&request.path, request.format)?;
        let size_bytes = artifact_size(&detection.entry)?;
        let native_quantization = detection.native_quantization;
        let parameter_count = request
            .parameter_count
            .or(detection.parameter_count)
            .unwrap_or_else(|| (size_bytes as f64 / native_quantization.bytes_per_weight()) as u64);
        let id = request
            .model_id
            .clone()
            .unwrap_or_else(|| ModelId::from_path(&request.path));

        let descriptor = ModelDescriptor {
            id,
            path: detection.entry,
            format: detection.format,
            parameter_count,
            size_bytes,
            native_quantization,
        };
        debug!(?descriptor, "Described model artifact");
        Ok(descriptor)
    }

    /// Describes the artifact and decides how to load it on the current hardware.
    pub fn plan(&self, request: &LoadRequest) -> Result<LoadPlan> {
        let descriptor = self.describe(request)?;
        let profile = self.profiler.current();
        let policy = self.policy.decide(&descriptor, &profile)?;
        let backend = self
            .backends
            .iter()
            .find(|b| b.name() == policy.backend)
            .ok_or_else(|| Error::no_backend(format!("backend {} is not registered", policy.backend)))?;

        info!(
            model_id = %descriptor.id,
            format = %descriptor.format,
            backend = %policy.backend,
            quantization = %policy.quantization,
            threads = policy.threads,
            context = policy.context_window,
            "Load planned"
        );
        Ok(LoadPlan {
            descriptor,
            policy,
            loader: Loader::new(Arc::clone(backend)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{apple_profile, write_gguf, write_safetensors, ScriptedBackend};
    use tempfile::TempDir;

    fn factory() -> LoaderFactory {
        let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::default());
        LoaderFactory::new(
            vec![backend],
            PolicyConfig::default(),
            Arc::new(HardwareProfiler::fixed(apple_profile(16))),
        )
    }

    #[test]
    fn test_describe_estimates_parameters_from_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.gguf");
        write_gguf(&path, 3, 4);

        let descriptor = factory().describe(&LoadRequest::new(&path)).unwrap();
        assert_eq!(descriptor.format, ModelFormat::Gguf);
        assert!(descriptor.id.as_str().starts_with("tiny-"));
        let size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(descriptor.size_bytes, size);
        assert_eq!(descriptor.parameter_count, (size as f64 / 0.5625) as u64);
    }

    #[test]
    fn test_describe_prefers_caller_facts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path, &[("w", "F32", &[10])]);

        let request = LoadRequest::new(&path).with_id("custom").with_parameter_count(7);
        let descriptor = factory().describe(&request).unwrap();
        assert_eq!(descriptor.id.as_str(), "custom");
        assert_eq!(descriptor.parameter_count, 7);

        let descriptor = factory().describe(&LoadRequest::new(&path)).unwrap();
        assert_eq!(descriptor.parameter_count, 10);
    }

    #[test]
    fn test_plan_picks_registered_backend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.gguf");
        write_gguf(&path, 3, 4);

        let plan = factory().plan(&LoadRequest::new(&path)).unwrap();
        assert_eq!(plan.loader.backend_name(), "scripted");
        assert_eq!(plan.policy.backend, "scripted");
    }

    #[test]
    fn test_unrecognized_artifact_never_reaches_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readme.md");
        std::fs::write(&path, "# not a model").unwrap();
        let err = factory().plan(&LoadRequest::new(&path)).unwrap_err();
        assert_eq!(err.code(), "unrecognized_format");
    }

    #[test]
    fn test_loader_for_format() {
        assert!(factory().loader_for(ModelFormat::Onnx).is_some());
    }
}
