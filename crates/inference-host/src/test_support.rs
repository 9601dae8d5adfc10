//! Scripted backend, profiles and artifact writers shared by unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::hardware::{ChipTier, HardwareProfile};
use crate::model_runtime::{
    Backend, BackendCapabilities, Engine, EngineFault, EngineTokens, ExecutionTarget, GenerationParams,
    LoadPlan, Loader, ModelDescriptor, ModelFormat, PrefillOutcome, Quantization, TargetKind,
};
use crate::policy::OptimizationPolicy;
use crate::registry::ModelHandle;

const GIB: u64 = 1024 * 1024 * 1024;

pub(crate) fn apple_profile(memory_gib: u64) -> HardwareProfile {
    HardwareProfile {
        chip_family: "Apple M2 Pro".into(),
        chip_tier: ChipTier::Pro,
        performance_cores: 8,
        efficiency_cores: 4,
        gpu_cores: 19,
        has_neural_accelerator: true,
        total_memory_bytes: memory_gib * GIB,
        thermal_headroom: 100,
        captured_at: chrono::Utc::now(),
    }
}

pub(crate) fn cpu_profile(memory_gib: u64) -> HardwareProfile {
    HardwareProfile {
        chip_family: "AMD Ryzen 7 5800X".into(),
        chip_tier: ChipTier::Base,
        performance_cores: 8,
        efficiency_cores: 0,
        gpu_cores: 0,
        has_neural_accelerator: false,
        total_memory_bytes: memory_gib * GIB,
        thermal_headroom: 100,
        captured_at: chrono::Utc::now(),
    }
}

pub(crate) fn test_policy(backend: &str, footprint: u64, budget: u64) -> OptimizationPolicy {
    OptimizationPolicy {
        backend: backend.into(),
        cpu_only: false,
        quantization: Quantization::Q4KM,
        threads: 4,
        batch_size: 128,
        context_window: 4096,
        memory_reservation_bytes: footprint,
        budget_bytes: budget,
        expected_throughput: 1.0,
    }
}

fn descriptor(id: &str, footprint: u64) -> ModelDescriptor {
    let params = (footprint as f64 / Quantization::Q4KM.bytes_per_weight()) as u64;
    ModelDescriptor::new(id, format!("/models/{id}.gguf"), ModelFormat::Gguf, params)
}

pub(crate) fn ready_handle(id: &str, footprint: u64, engine: ScriptedEngine) -> Arc<ModelHandle> {
    ready_handle_with_policy(id, test_policy("scripted", footprint, 64 * GIB), engine)
}

pub(crate) fn ready_handle_with_policy(id: &str, policy: OptimizationPolicy, engine: ScriptedEngine) -> Arc<ModelHandle> {
    let descriptor = descriptor(id, policy.memory_reservation_bytes);
    Arc::new(ModelHandle::new(descriptor, policy, Arc::new(engine), 0))
}

/// A plan that loads `id` through `backend` with a fixed footprint and budget.
pub(crate) fn plan_for(backend: &ScriptedBackend, id: &str, footprint: u64, budget: u64) -> LoadPlan {
    LoadPlan {
        descriptor: descriptor(id, footprint),
        policy: test_policy(backend.name(), footprint, budget),
        loader: Loader::new(Arc::new(backend.clone())),
    }
}

#[derive(Clone)]
struct EngineScript {
    targets: Vec<ExecutionTarget>,
    tokens: Vec<String>,
    token_delay: Duration,
    dimension: Option<usize>,
    wrong_width: bool,
    fail_requests: bool,
    corrupt: bool,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            targets: vec![
                ExecutionTarget::new(TargetKind::Gpu, 1),
                ExecutionTarget::new(TargetKind::Cpu, 2),
            ],
            tokens: vec!["Hello".into(), ",".into(), " world".into()],
            token_delay: Duration::ZERO,
            dimension: Some(8),
            wrong_width: false,
            fail_requests: false,
            corrupt: false,
        }
    }
}

/// In-memory engine that replays a fixed token script.
#[derive(Clone, Default)]
pub(crate) struct ScriptedEngine {
    script: EngineScript,
    shutdowns: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub(crate) fn with_targets(mut self, targets: Vec<ExecutionTarget>) -> Self {
        self.script.targets = targets;
        self
    }

    pub(crate) fn shutdown_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.shutdowns)
    }

    fn check(&self) -> Result<(), EngineFault> {
        if self.script.corrupt {
            return Err(EngineFault::Corrupted(anyhow::anyhow!("kv cache poisoned")));
        }
        if self.script.fail_requests {
            return Err(EngineFault::Failed(anyhow::anyhow!("scripted request failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn targets(&self) -> &[ExecutionTarget] {
        &self.script.targets
    }

    fn embedding_dimension(&self) -> Option<usize> {
        self.script.dimension
    }

    async fn prefill(
        &self,
        _target: TargetKind,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<PrefillOutcome, EngineFault> {
        self.check()?;
        Ok(PrefillOutcome {
            prompt_tokens: prompt.split_whitespace().count().max(1) as u32,
        })
    }

    async fn decode(
        &self,
        _target: TargetKind,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<EngineTokens, EngineFault> {
        self.check()?;
        let delay = self.script.token_delay;
        let tokens = self.script.tokens.clone();
        Ok(futures::stream::iter(tokens)
            .then(move |token| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(token)
            })
            .boxed())
    }

    async fn embed(&self, _target: TargetKind, text: &str) -> Result<Vec<f32>, EngineFault> {
        self.check()?;
        let width = self.script.dimension.unwrap_or(0) + usize::from(self.script.wrong_width);
        Ok((0..width).map(|i| (text.len() + i) as f32).collect())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend whose loads and engines follow a script; counts loads and teardowns.
#[derive(Clone)]
pub(crate) struct ScriptedBackend {
    capabilities: BackendCapabilities,
    load_delay: Duration,
    load_error: Option<String>,
    panic_on_load: bool,
    engine: EngineScript,
    loads: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            capabilities: BackendCapabilities {
                name: "scripted".into(),
                formats: ModelFormat::ALL.to_vec(),
                targets: EngineScript::default().targets,
                thread_cap: 8,
            },
            load_delay: Duration::ZERO,
            load_error: None,
            panic_on_load: false,
            engine: EngineScript::default(),
            loads: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ScriptedBackend {
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub(crate) fn failing(mut self, message: &str) -> Self {
        self.load_error = Some(message.into());
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panic_on_load = true;
        self
    }

    pub(crate) fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.engine.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub(crate) fn with_token_delay(mut self, delay: Duration) -> Self {
        self.engine.token_delay = delay;
        self
    }

    pub(crate) fn with_dimension(mut self, dimension: usize) -> Self {
        self.engine.dimension = Some(dimension);
        self
    }

    pub(crate) fn with_wrong_embedding_width(mut self) -> Self {
        self.engine.wrong_width = true;
        self
    }

    pub(crate) fn failing_requests(mut self) -> Self {
        self.engine.fail_requests = true;
        self
    }

    pub(crate) fn corrupting(mut self) -> Self {
        self.engine.corrupt = true;
        self
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    async fn load(
        &self,
        _descriptor: &ModelDescriptor,
        _policy: &OptimizationPolicy,
    ) -> anyhow::Result<Arc<dyn Engine>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.panic_on_load {
            panic!("scripted loader panic");
        }
        if let Some(message) = &self.load_error {
            anyhow::bail!("{}", message);
        }
        Ok(Arc::new(ScriptedEngine {
            script: self.engine.clone(),
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

/// Minimal GGUF header followed by padding.
pub(crate) fn write_gguf(path: &Path, version: u32, tensors: u64) {
    let mut bytes = b"GGUF".to_vec();
    bytes.extend_from_slice(&version.to_le_bytes());
    if version == 1 {
        bytes.extend_from_slice(&(tensors as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
    } else {
        bytes.extend_from_slice(&tensors.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
    }
    bytes.extend_from_slice(&[0u8; 64]);
    std::fs::write(path, bytes).unwrap();
}

/// Safetensors file with zeroed data for `(name, dtype, shape)` tensors.
pub(crate) fn write_safetensors(path: &Path, tensors: &[(&str, &str, &[u64])]) {
    let mut header = serde_json::Map::new();
    let mut offset = 0u64;
    for (name, dtype, shape) in tensors {
        let width = match *dtype {
            "F64" => 8,
            "F32" | "U32" | "I32" => 4,
            "F16" | "BF16" => 2,
            _ => 1,
        };
        let len = shape.iter().product::<u64>() * width;
        header.insert(
            name.to_string(),
            serde_json::json!({ "dtype": dtype, "shape": shape, "data_offsets": [offset, offset + len] }),
        );
        offset += len;
    }
    let header = serde_json::to_vec(&header).unwrap();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes.resize(bytes.len() + offset as usize, 0);
    std::fs::write(path, bytes).unwrap();
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Zip archive with uncompressed entries.
pub(crate) fn stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    // 2024-01-01 00:00 in DOS format.
    const DOS_DATE: u16 = (44 << 9) | (1 << 5) | 1;

    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data) in entries {
        let offset = out.len() as u32;
        let crc = crc32(data);
        let size = data.len() as u32;

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // stored
        out.extend_from_slice(&0u16.to_le_bytes()); // time
        out.extend_from_slice(&DOS_DATE.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes()); // made by
        central.extend_from_slice(&20u16.to_le_bytes()); // needed
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&DOS_DATE.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&size.to_le_bytes());
        central.extend_from_slice(&size.to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes()); // extra
        central.extend_from_slice(&0u16.to_le_bytes()); // comment
        central.extend_from_slice(&0u16.to_le_bytes()); // disk
        central.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        central.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }

    let central_offset = out.len() as u32;
    let count = entries.len() as u16;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&central_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

#[test]
fn test_crc32_known_value() {
    assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
}
