//! Top-level facade wiring profiler, loader factory, registry, dispatcher
//! and inference engine together.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::error::Result;
use crate::events::{EventBus, LifecycleEvent};
use crate::hardware::{HardwareProfile, HardwareProfiler, RefreshTask, SystemProbe};
use crate::inference::{Completion, InferenceEngine, TokenStream};
use crate::metrics::LifecycleMetrics;
use crate::model_runtime::{
    Backend, GenerationParams, LoadRequest, LoaderFactory, ModelDescriptor, ModelId, PortAllocator, ServerBackend,
    ServerFlavor,
};
use crate::policy::{OptimizationPolicy, PolicyConfig};
use crate::registry::{ModelHandle, ModelRegistry, ModelSummary};

pub struct InferenceHost {
    profiler: Arc<HardwareProfiler>,
    factory: LoaderFactory,
    registry: ModelRegistry,
    inference: InferenceEngine,
    events: EventBus,
    metrics: Arc<LifecycleMetrics>,
    _refresh: Option<RefreshTask>,
}

impl InferenceHost {
    /// Must be called inside a tokio runtime: the metrics collector runs as a
    /// background task.
    pub fn new(
        profiler: Arc<HardwareProfiler>,
        backends: Vec<Arc<dyn Backend>>,
        budget: PolicyConfig,
        dispatch: DispatchConfig,
    ) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let metrics = Arc::new(LifecycleMetrics::new()?);
        metrics.spawn_collector(&events);

        let factory = LoaderFactory::new(backends, budget, Arc::clone(&profiler));
        let registry = ModelRegistry::new(events.clone());
        let dispatcher = Arc::new(Dispatcher::new(dispatch, Arc::clone(&profiler), events.clone()));
        let inference = InferenceEngine::new(registry.clone(), dispatcher);

        Ok(Self {
            profiler,
            factory,
            registry,
            inference,
            events,
            metrics,
            _refresh: None,
        })
    }

    /// Probes the real hardware, registers every model server that can be
    /// found and starts the periodic profile refresh.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let profiler = Arc::new(HardwareProfiler::new(SystemProbe));
        let ports = Arc::new(PortAllocator::new(config.runtime_base_port));

        let backends: Vec<Arc<dyn Backend>> = ServerFlavor::ALL
            .iter()
            .filter_map(|&flavor| {
                ServerBackend::discover(
                    flavor,
                    config.server_binary(flavor),
                    config.server_settings(flavor),
                    Arc::clone(&ports),
                )
            })
            .map(|backend| Arc::new(backend) as Arc<dyn Backend>)
            .collect();
        if backends.is_empty() {
            warn!("No model server binaries found; every load will fail with no_compatible_backend");
        }

        let mut host = Self::new(profiler, backends, config.budget(), config.dispatch_config())?;
        host._refresh = Some(host.profiler.spawn_refresh_task(config.profile_refresh_interval()));
        info!(backends = ?host.factory.backend_names(), "Inference host ready");
        Ok(host)
    }

    pub fn profile(&self) -> Arc<HardwareProfile> {
        self.profiler.current()
    }

    pub fn profiler(&self) -> &Arc<HardwareProfiler> {
        &self.profiler
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Classifies an artifact without planning or loading it.
    pub fn describe(&self, request: &LoadRequest) -> Result<ModelDescriptor> {
        self.factory.describe(request)
    }

    /// Policy the host would apply to `request` on the current hardware.
    pub fn plan(&self, request: &LoadRequest) -> Result<OptimizationPolicy> {
        self.factory.plan(request).map(|plan| plan.policy)
    }

    /// Detects, plans and loads. Detection and policy failures return before
    /// the registry is touched.
    pub async fn request_load(&self, request: LoadRequest) -> Result<Arc<ModelHandle>> {
        let plan = match self.factory.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                let model_id = request
                    .model_id
                    .clone()
                    .unwrap_or_else(|| ModelId::from_path(&request.path));
                warn!(model_id = %model_id, path = %request.path.display(), "Load rejected: {}", e);
                self.events.publish(LifecycleEvent::LoadFailed {
                    model_id,
                    code: e.code(),
                    cause: e.to_string(),
                });
                return Err(e);
            }
        };
        self.registry.load(plan).await
    }

    /// Shorthand for loading a path with detected defaults.
    pub async fn load_path(&self, path: impl Into<PathBuf>) -> Result<Arc<ModelHandle>> {
        self.request_load(LoadRequest::new(path)).await
    }

    pub fn list_models(&self) -> Vec<ModelSummary> {
        self.registry.list_models()
    }

    pub async fn generate(&self, model_id: &ModelId, prompt: &str, params: &GenerationParams) -> Result<Completion> {
        self.inference.generate(model_id, prompt, params).await
    }

    pub async fn stream_generate(
        &self,
        model_id: &ModelId,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream> {
        self.inference.stream_generate(model_id, prompt, params).await
    }

    pub async fn embed(&self, model_id: &ModelId, text: &str) -> Result<Vec<f32>> {
        self.inference.embed(model_id, text).await
    }

    pub async fn unload(&self, model_id: &ModelId) -> Result<()> {
        self.registry.unload(model_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
