//! Process-backed backends.
//!
//! Each load spawns a model server (llama.cpp `llama-server` or a
//! format-specific equivalent) on its own port and talks to it over HTTP:
//! prefill warms the prompt cache, decode streams tokens over SSE and
//! embeddings come from `/embedding`.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::backend::{
    Backend, BackendCapabilities, Engine, EngineFault, EngineTokens, ExecutionTarget, GenerationParams,
    Phase, PrefillOutcome, TargetKind,
};
use super::descriptor::ModelDescriptor;
use super::format::ModelFormat;
use crate::policy::OptimizationPolicy;

const HEALTH_POLL: Duration = Duration::from_millis(500);

/// Model server families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerFlavor {
    LlamaCpp,
    Mlx,
    CoreMl,
    Onnx,
    Torch,
}

impl ServerFlavor {
    /// Registration order, most capable first.
    pub const ALL: [ServerFlavor; 5] = [
        ServerFlavor::LlamaCpp,
        ServerFlavor::Mlx,
        ServerFlavor::CoreMl,
        ServerFlavor::Onnx,
        ServerFlavor::Torch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ServerFlavor::LlamaCpp => "llama.cpp",
            ServerFlavor::Mlx => "mlx",
            ServerFlavor::CoreMl => "coreml",
            ServerFlavor::Onnx => "onnx",
            ServerFlavor::Torch => "torch",
        }
    }

    /// Executable looked up on `PATH` when no binary is configured.
    pub fn default_binary(&self) -> &'static str {
        match self {
            ServerFlavor::LlamaCpp => "llama-server",
            ServerFlavor::Mlx => "mlx-server",
            ServerFlavor::CoreMl => "coreml-server",
            ServerFlavor::Onnx => "onnx-server",
            ServerFlavor::Torch => "torch-server",
        }
    }

    pub fn formats(&self) -> Vec<ModelFormat> {
        match self {
            ServerFlavor::LlamaCpp => vec![ModelFormat::Gguf],
            ServerFlavor::Mlx => vec![ModelFormat::Mlx, ModelFormat::Safetensors],
            ServerFlavor::CoreMl => vec![ModelFormat::CoreMl],
            ServerFlavor::Onnx => vec![ModelFormat::Onnx],
            ServerFlavor::Torch => vec![ModelFormat::Checkpoint, ModelFormat::Safetensors],
        }
    }

    pub fn targets(&self) -> Vec<ExecutionTarget> {
        match self {
            ServerFlavor::LlamaCpp => vec![
                ExecutionTarget::new(TargetKind::Gpu, 4),
                ExecutionTarget::new(TargetKind::Cpu, 4),
            ],
            ServerFlavor::Mlx => vec![
                ExecutionTarget::new(TargetKind::Gpu, 2),
                ExecutionTarget::new(TargetKind::Cpu, 1),
            ],
            ServerFlavor::CoreMl => vec![
                ExecutionTarget::new(TargetKind::NeuralAccelerator, 1)
                    .with_phases(&[Phase::Prefill, Phase::Embedding]),
                ExecutionTarget::new(TargetKind::Gpu, 1),
                ExecutionTarget::new(TargetKind::Cpu, 1),
            ],
            ServerFlavor::Onnx => vec![ExecutionTarget::new(TargetKind::Cpu, 2)],
            ServerFlavor::Torch => vec![ExecutionTarget::new(TargetKind::Cpu, 1)],
        }
    }

    /// Lanes served by a process started under `policy`. A CPU-only process
    /// offloads nothing, so it only gets the CPU lane.
    pub fn lanes(&self, policy: &OptimizationPolicy) -> Vec<ExecutionTarget> {
        let targets = self.targets();
        if !policy.cpu_only {
            return targets;
        }
        targets.into_iter().filter(|t| t.kind == TargetKind::Cpu).collect()
    }

    fn args(&self, descriptor: &ModelDescriptor, policy: &OptimizationPolicy, host: &str, port: u16) -> Vec<String> {
        // One server slot per lane permit.
        let parallel: usize = self.lanes(policy).iter().map(|t| t.max_concurrency).sum();
        let mut args = vec![
            "--model".to_string(),
            descriptor.path.display().to_string(),
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--ctx-size".to_string(),
            policy.context_window.to_string(),
            "--threads".to_string(),
            policy.threads.to_string(),
            "--parallel".to_string(),
            parallel.to_string(),
        ];
        match self {
            ServerFlavor::LlamaCpp => {
                let gpu_layers = if policy.cpu_only { 0 } else { 999 };
                args.extend([
                    "--batch-size".to_string(),
                    policy.batch_size.to_string(),
                    "--n-gpu-layers".to_string(),
                    gpu_layers.to_string(),
                    "--embeddings".to_string(),
                ]);
            }
            _ => {
                args.extend(["--quantization".to_string(), policy.quantization.label().to_string()]);
                if policy.cpu_only {
                    args.push("--cpu-only".to_string());
                }
            }
        }
        args
    }
}

/// Hands out model server ports from a base port upward, wrapping back to
/// the base past the top of the range. Ports something already listens on
/// are skipped.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        let base = base.max(1);
        Self {
            base,
            next: AtomicU16::new(base),
        }
    }

    fn next_port(&self) -> u16 {
        let base = self.base;
        let advance = |port: u16| Some(port.checked_add(1).unwrap_or(base));
        match self.next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, advance) {
            Ok(port) | Err(port) => port,
        }
    }

    /// Next port in the range that `host` can bind right now.
    pub fn allocate(&self, host: &str) -> anyhow::Result<u16> {
        let range = usize::from(u16::MAX - self.base) + 1;
        for _ in 0..range {
            let port = self.next_port();
            if std::net::TcpListener::bind((host, port)).is_ok() {
                return Ok(port);
            }
            debug!(port, "Port in use, skipping");
        }
        anyhow::bail!("No free port on {} at or above {}", host, self.base)
    }
}

/// Process and HTTP settings shared by every server backend.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub thread_cap: u32,
}

pub struct ServerBackend {
    flavor: ServerFlavor,
    binary: PathBuf,
    settings: ServerSettings,
    capabilities: BackendCapabilities,
    ports: Arc<PortAllocator>,
}

impl ServerBackend {
    pub fn new(flavor: ServerFlavor, binary: PathBuf, settings: ServerSettings, ports: Arc<PortAllocator>) -> Self {
        let capabilities = BackendCapabilities {
            name: flavor.name().to_string(),
            formats: flavor.formats(),
            targets: flavor.targets(),
            thread_cap: settings.thread_cap,
        };
        Self {
            flavor,
            binary,
            settings,
            capabilities,
            ports,
        }
    }

    /// Backend for `flavor` if its server binary is configured or on `PATH`.
    pub fn discover(
        flavor: ServerFlavor,
        configured: Option<PathBuf>,
        settings: ServerSettings,
        ports: Arc<PortAllocator>,
    ) -> Option<Self> {
        let binary = match configured {
            Some(path) if path.exists() => path,
            Some(path) => {
                warn!("{} server binary not found at {}", flavor.name(), path.display());
                return None;
            }
            None => which::which(flavor.default_binary()).ok()?,
        };
        info!("Registered {} backend using {}", flavor.name(), binary.display());
        Some(Self::new(flavor, binary, settings, ports))
    }

    pub fn flavor(&self) -> ServerFlavor {
        self.flavor
    }
}

#[async_trait]
impl Backend for ServerBackend {
    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        policy: &OptimizationPolicy,
    ) -> anyhow::Result<Arc<dyn Engine>> {
        if !descriptor.path.exists() {
            anyhow::bail!("Model not found: {}", descriptor.path.display());
        }
        let port = self.ports.allocate(&self.settings.host)?;
        let args = self.flavor.args(descriptor, policy, &self.settings.host, port);

        info!("Starting {} server for model: {}", self.flavor.name(), descriptor.path.display());
        info!("  Binary: {}", self.binary.display());
        info!("  Port: {}", port);
        info!("  Context Size: {}", policy.context_window);
        info!("  Threads: {}", policy.threads);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn {}: {}", self.binary.display(), e))?;

        let base_url = format!("http://{}:{}", self.settings.host, port);
        let mut engine = ServerEngine::attach(base_url, self.flavor.lanes(policy), self.settings.request_timeout)
            .with_process(child);
        engine.wait_ready(self.settings.health_timeout).await?;
        engine.probe_embedding_dimension().await;

        info!("{} server ready for {}", self.flavor.name(), descriptor.id);
        Ok(Arc::new(engine))
    }
}

/// HTTP client for one running model server.
pub struct ServerEngine {
    base_url: String,
    client: reqwest::Client,
    targets: Vec<ExecutionTarget>,
    dimension: Option<usize>,
    process: Mutex<Option<Child>>,
}

impl ServerEngine {
    /// Engine for a server already listening at `base_url`.
    pub fn attach(base_url: impl Into<String>, targets: Vec<ExecutionTarget>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            targets,
            dimension: None,
            process: Mutex::new(None),
        }
    }

    fn with_process(mut self, child: Child) -> Self {
        self.process = Mutex::new(Some(child));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_ready(&self) -> bool {
        let health_url = format!("{}/health", self.base_url);
        match self.client.get(&health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Polls `/health` until the server answers, the process exits or the
    /// timeout passes.
    pub async fn wait_ready(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let started = Instant::now();
        loop {
            if self.is_ready().await {
                info!("Model server ready after {:.1}s", started.elapsed().as_secs_f32());
                return Ok(());
            }
            if let Some(status) = self.exit_status().await {
                anyhow::bail!("Model server exited during startup ({})", status);
            }
            if started.elapsed() >= timeout {
                anyhow::bail!("Model server failed to start within {} seconds", timeout.as_secs());
            }
            sleep(HEALTH_POLL).await;
        }
    }

    /// Reads the embedding width from `/v1/models` (llama.cpp reports it as
    /// `meta.n_embd`). Leaves the width unknown if the server does not say.
    pub async fn probe_embedding_dimension(&mut self) {
        let url = format!("{}/v1/models", self.base_url);
        let width = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v["data"][0]["meta"]["n_embd"].as_u64()),
            _ => None,
        };
        self.dimension = width.map(|w| w as usize);
        debug!(dimension = ?self.dimension, "Probed embedding dimension");
    }

    async fn exit_status(&self) -> Option<std::process::ExitStatus> {
        let mut process = self.process.lock().await;
        process.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }

    /// Request failures after the server process died mean the loaded model
    /// is gone, not that this one request failed.
    async fn fault(&self, err: anyhow::Error) -> EngineFault {
        match self.exit_status().await {
            Some(status) => EngineFault::Corrupted(err.context(format!("model server exited ({})", status))),
            None => EngineFault::Failed(err),
        }
    }

    async fn post(&self, path: &str, payload: &Value) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Request to {} failed: {}", path, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} failed ({}): {}", path, status, body);
        }
        Ok(resp)
    }
}

fn completion_payload(prompt: &str, params: &GenerationParams, n_predict: i64, stream: bool) -> Value {
    let mut payload = json!({
        "prompt": prompt,
        "n_predict": n_predict,
        "temperature": params.temperature,
        "top_p": params.top_p,
        "stop": params.stop,
        "cache_prompt": true,
        "stream": stream,
    });
    if let Some(seed) = params.seed {
        payload["seed"] = json!(seed);
    }
    payload
}

/// Accepts both `{"embedding": [..]}` and `[{"embedding": [[..]]}]` shapes.
fn parse_embedding(value: &Value) -> Option<Vec<f32>> {
    let embedding = match value {
        Value::Array(items) => items.first()?.get("embedding")?,
        Value::Object(_) => value.get("embedding")?,
        _ => return None,
    };
    let row = match embedding.as_array()?.first() {
        Some(Value::Array(_)) => embedding.as_array()?.first()?,
        _ => embedding,
    };
    row.as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Accumulates raw stream bytes and hands out complete lines. Decoding waits
/// for the newline, so a character split across chunks arrives intact.
#[derive(Default)]
struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let line = self.pending.split_to(newline + 1);
        Some(String::from_utf8_lossy(&line[..newline]).trim().to_string())
    }
}

#[async_trait]
impl Engine for ServerEngine {
    fn targets(&self) -> &[ExecutionTarget] {
        &self.targets
    }

    fn embedding_dimension(&self) -> Option<usize> {
        self.dimension
    }

    async fn prefill(
        &self,
        target: TargetKind,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<PrefillOutcome, EngineFault> {
        debug!(%target, "Prefill request");
        let payload = completion_payload(prompt, params, 0, false);
        let resp = match self.post("/completion", &payload).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.fault(e).await),
        };
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineFault::Failed(anyhow::anyhow!("Failed to parse prefill response: {}", e)))?;
        let prompt_tokens = body["tokens_evaluated"]
            .as_u64()
            .or_else(|| body["timings"]["prompt_n"].as_u64())
            .unwrap_or(0);
        Ok(PrefillOutcome {
            prompt_tokens: prompt_tokens as u32,
        })
    }

    async fn decode(
        &self,
        target: TargetKind,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<EngineTokens, EngineFault> {
        debug!(%target, "Decode request");
        let payload = completion_payload(prompt, params, params.max_tokens as i64, true);
        let resp = match self.post("/completion", &payload).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.fault(e).await),
        };
        let byte_stream = resp.bytes_stream();

        let sse_stream = async_stream::try_stream! {
            let mut lines = LineBuffer::default();
            futures_util::pin_mut!(byte_stream);

            'events: while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result
                    .map_err(|e| EngineFault::Failed(anyhow::anyhow!("Stream read error: {}", e)))?;
                lines.extend(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'events;
                    }

                    let event: Value = serde_json::from_str(data)
                        .map_err(|e| EngineFault::Failed(anyhow::anyhow!("Malformed stream event: {}", e)))?;
                    if let Some(content) = event["content"].as_str().filter(|c| !c.is_empty()) {
                        yield content.to_string();
                    }
                    if event["stop"].as_bool().unwrap_or(false) {
                        break 'events;
                    }
                }
            }
        };

        Ok(Box::pin(sse_stream))
    }

    async fn embed(&self, target: TargetKind, text: &str) -> Result<Vec<f32>, EngineFault> {
        debug!(%target, "Embedding request");
        let resp = match self.post("/embedding", &json!({ "content": text })).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.fault(e).await),
        };
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineFault::Failed(anyhow::anyhow!("Failed to parse embedding response: {}", e)))?;
        parse_embedding(&body)
            .ok_or_else(|| EngineFault::Failed(anyhow::anyhow!("Embedding response has no vector")))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Shutting down model server at {}", self.base_url);
        if let Some(mut child) = self.process.lock().await.take() {
            match child.kill().await {
                Ok(()) => info!("Model server process killed successfully"),
                Err(e) => warn!("Failed to kill model server process: {}", e),
            }
        }
        Ok(())
    }
}
