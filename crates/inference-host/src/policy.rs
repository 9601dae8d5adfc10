//! Optimization policy engine.
//!
//! `decide` is a pure function of (descriptor, profile, config, backend
//! capabilities): no clocks, no hardware queries, no randomness.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hardware::HardwareProfile;
use crate::model_runtime::{BackendCapabilities, ModelDescriptor, Quantization, TargetKind};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Tunable inputs of the memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Share of usable memory loaded models may occupy.
    pub budget_fraction: f64,
    /// Share of total memory reserved for the OS and the host process.
    pub reserved_fraction: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            budget_fraction: 0.60,
            reserved_fraction: 0.10,
        }
    }
}

impl PolicyConfig {
    /// Bytes available to loaded models on a host with `total_memory` bytes.
    pub fn budget_bytes(&self, total_memory: u64) -> u64 {
        let usable = total_memory as f64 * (1.0 - self.reserved_fraction);
        (usable * self.budget_fraction).max(0.0) as u64
    }
}

/// Load-time decision for one model on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPolicy {
    pub backend: String,
    /// No loadable backend runs on GPU or accelerator for this format.
    pub cpu_only: bool,
    pub quantization: Quantization,
    pub threads: u32,
    pub batch_size: u32,
    pub context_window: u32,
    pub memory_reservation_bytes: u64,
    pub budget_bytes: u64,
    /// Relative throughput expected under current thermal headroom (1.0 = nominal).
    pub expected_throughput: f32,
}

pub struct PolicyEngine {
    config: PolicyConfig,
    backends: Vec<BackendCapabilities>,
}

impl PolicyEngine {
    /// `backends` in preference order; earlier entries win ties.
    pub fn new(config: PolicyConfig, backends: Vec<BackendCapabilities>) -> Self {
        Self { config, backends }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn budget_bytes(&self, profile: &HardwareProfile) -> u64 {
        self.config.budget_bytes(profile.total_memory_bytes)
    }

    pub fn decide(&self, descriptor: &ModelDescriptor, profile: &HardwareProfile) -> Result<OptimizationPolicy> {
        let format = descriptor.format;
        let loadable: Vec<&BackendCapabilities> =
            self.backends.iter().filter(|b| b.loadable(format)).collect();
        if loadable.is_empty() {
            return Err(Error::no_backend(format!("no backend loads {} models", format)));
        }

        let cpu_only = !loadable.iter().any(|b| b.is_accelerated());
        let backend = loadable
            .iter()
            .copied()
            .find(|b| {
                !cpu_only
                    && b.targets
                        .iter()
                        .any(|t| t.kind.is_accelerated() && profile.supports(t.kind))
            })
            .or_else(|| loadable.iter().copied().find(|b| b.has_target(TargetKind::Cpu)))
            .ok_or_else(|| {
                Error::no_backend(format!(
                    "no backend for {} models runs on this hardware ({})",
                    format, profile.chip_family
                ))
            })?;

        let budget = self.budget_bytes(profile);
        let candidates = Quantization::candidates(format, descriptor.native_quantization);
        let (quantization, reservation) = candidates
            .iter()
            .map(|q| (*q, q.estimate_bytes(descriptor.parameter_count)))
            .find(|(_, bytes)| *bytes <= budget)
            .ok_or_else(|| Error::InsufficientMemory {
                required: candidates
                    .iter()
                    .map(|q| q.estimate_bytes(descriptor.parameter_count))
                    .min()
                    .unwrap_or(descriptor.size_bytes),
                budget,
            })?;

        let headroom = budget - reservation;
        let threads = profile.performance_cores.max(1).min(backend.thread_cap.max(1));
        let context_window = context_window_for(headroom);
        let uses_gpu = !cpu_only && backend.is_accelerated() && profile.has_gpu();
        let batch_size = batch_size_for(headroom, context_window, uses_gpu);
        let expected_throughput = expected_throughput(profile.thermal_headroom);

        if expected_throughput < 1.0 {
            info!(
                model_id = %descriptor.id,
                thermal_headroom = profile.thermal_headroom,
                "Thermal headroom low, expecting {:.0}% of nominal throughput",
                expected_throughput * 100.0
            );
        }

        let policy = OptimizationPolicy {
            backend: backend.name.clone(),
            cpu_only,
            quantization,
            threads,
            batch_size,
            context_window,
            memory_reservation_bytes: reservation,
            budget_bytes: budget,
            expected_throughput,
        };
        debug!(model_id = %descriptor.id, ?policy, "Optimization policy decided");
        Ok(policy)
    }
}

fn context_window_for(headroom: u64) -> u32 {
    match headroom {
        h if h < GIB / 2 => 2048,
        h if h < GIB => 4096,
        h if h < 2 * GIB => 8192,
        h if h < 4 * GIB => 16384,
        _ => 32768,
    }
}

fn estimate_memory_per_batch(context_window: u32, uses_gpu: bool) -> f64 {
    let per_k = if uses_gpu { 0.5 } else { 1.2 };
    (context_window as f64 / 1024.0) * per_k
}

fn batch_size_for(headroom: u64, context_window: u32, uses_gpu: bool) -> u32 {
    let headroom_mb = (headroom / MIB) as f64;
    let max_batch = (headroom_mb / estimate_memory_per_batch(context_window, uses_gpu)).max(1.0);
    apply_batch_limits(max_batch.min(u32::MAX as f64) as u32, context_window)
}

fn apply_batch_limits(batch_size: u32, context_window: u32) -> u32 {
    let limited = batch_size.clamp(16, 1024);
    match context_window {
        0..=2048 => limited.min(512),
        2049..=4096 => limited.min(384),
        4097..=8192 => limited.min(256),
        8193..=16384 => limited.min(128),
        16385..=32768 => limited.min(64),
        _ => limited.min(32),
    }
}

fn expected_throughput(thermal_headroom: u8) -> f32 {
    if thermal_headroom >= 50 {
        1.0
    } else {
        0.5 + thermal_headroom as f32 / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::{ExecutionTarget, ModelFormat};
    use crate::test_support::{apple_profile, cpu_profile};
    use proptest::prelude::*;

    fn backends() -> Vec<BackendCapabilities> {
        vec![
            BackendCapabilities {
                name: "llama.cpp".into(),
                formats: vec![ModelFormat::Gguf],
                targets: vec![
                    ExecutionTarget::new(TargetKind::Gpu, 4),
                    ExecutionTarget::new(TargetKind::Cpu, 4),
                ],
                thread_cap: 8,
            },
            BackendCapabilities {
                name: "mlx".into(),
                formats: vec![ModelFormat::Mlx, ModelFormat::Safetensors],
                targets: vec![
                    ExecutionTarget::new(TargetKind::Gpu, 2),
                    ExecutionTarget::new(TargetKind::Cpu, 1),
                ],
                thread_cap: 8,
            },
            BackendCapabilities {
                name: "onnx".into(),
                formats: vec![ModelFormat::Onnx],
                targets: vec![ExecutionTarget::new(TargetKind::Cpu, 2)],
                thread_cap: 16,
            },
        ]
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig::default(), backends())
    }

    /// GGUF descriptor sized `gib` GiB at its native Q4_K_M precision.
    fn gguf(gib: u64) -> ModelDescriptor {
        let params = (gib * GIB) as f64 / Quantization::Q4KM.bytes_per_weight();
        ModelDescriptor::new("m1", "/models/m1.gguf", ModelFormat::Gguf, params as u64)
    }

    #[test]
    fn test_budget_split() {
        let config = PolicyConfig::default();
        let budget = config.budget_bytes(16 * GIB);
        let expected = (16.0 * GIB as f64 * 0.9 * 0.6) as u64;
        assert_eq!(budget, expected);
    }

    #[test]
    fn test_default_quantization_selected_when_it_fits() {
        let policy = engine().decide(&gguf(4), &apple_profile(16)).unwrap();
        assert_eq!(policy.backend, "llama.cpp");
        assert_eq!(policy.quantization, Quantization::Q4KM);
        assert!(!policy.cpu_only);
        assert!(policy.memory_reservation_bytes <= policy.budget_bytes);
    }

    #[test]
    fn test_cpu_only_when_format_has_no_accelerated_backend() {
        let descriptor = ModelDescriptor::new("m", "/m.onnx", ModelFormat::Onnx, 1_000_000);
        let policy = engine().decide(&descriptor, &apple_profile(64)).unwrap();
        assert!(policy.cpu_only);
        assert_eq!(policy.backend, "onnx");
    }

    #[test]
    fn test_load_time_quantization_steps_down() {
        // 7B params at F16 = 14 GB; budget on 16 GiB is ~8.6 GiB.
        let descriptor = ModelDescriptor::new("m", "/m", ModelFormat::Safetensors, 7_000_000_000);
        let policy = engine().decide(&descriptor, &apple_profile(16)).unwrap();
        assert_eq!(policy.quantization, Quantization::Q8_0);
    }

    #[test]
    fn test_insufficient_memory_when_nothing_fits() {
        let err = engine().decide(&gguf(40), &apple_profile(16)).unwrap_err();
        match err {
            Error::InsufficientMemory { required, budget } => assert!(required > budget),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_format_has_no_backend() {
        let descriptor = ModelDescriptor::new("m", "/m.pt", ModelFormat::Checkpoint, 1_000);
        let err = engine().decide(&descriptor, &apple_profile(16)).unwrap_err();
        assert_eq!(err.code(), "no_compatible_backend");
    }

    #[test]
    fn test_threads_capped_by_backend_and_cores() {
        let mut profile = cpu_profile(32);
        profile.performance_cores = 24;
        let policy = engine().decide(&gguf(1), &profile).unwrap();
        assert_eq!(policy.threads, 8);

        profile.performance_cores = 0;
        let policy = engine().decide(&gguf(1), &profile).unwrap();
        assert_eq!(policy.threads, 1);
    }

    #[test]
    fn test_thermal_headroom_never_rejects_load() {
        let mut profile = apple_profile(16);
        profile.thermal_headroom = 0;
        let policy = engine().decide(&gguf(4), &profile).unwrap();
        assert!((policy.expected_throughput - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_batch_limits() {
        assert!(apply_batch_limits(1024, 1024) <= 512);
        assert!(apply_batch_limits(1024, 24576) <= 64);
        assert!(apply_batch_limits(1, 8192) >= 16);
    }

    proptest! {
        #[test]
        fn prop_decide_is_deterministic(gib in 1u64..64, params in 1_000_000u64..80_000_000_000) {
            let descriptor = ModelDescriptor::new("m", "/m", ModelFormat::Safetensors, params);
            let profile = apple_profile(gib);
            let a = engine().decide(&descriptor, &profile);
            let b = engine().decide(&descriptor, &profile);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_reservation_within_budget(gib in 1u64..64, params in 1_000_000u64..80_000_000_000) {
            let descriptor = ModelDescriptor::new("m", "/m", ModelFormat::Safetensors, params);
            if let Ok(policy) = engine().decide(&descriptor, &apple_profile(gib)) {
                prop_assert!(policy.memory_reservation_bytes <= policy.budget_bytes);
                prop_assert!(policy.batch_size >= 16 && policy.batch_size <= 512);
            }
        }

        #[test]
        fn prop_more_memory_never_lowers_precision(gib in 1u64..32, params in 1_000_000u64..40_000_000_000) {
            let descriptor = ModelDescriptor::new("m", "/m", ModelFormat::Safetensors, params);
            let small = engine().decide(&descriptor, &apple_profile(gib));
            let large = engine().decide(&descriptor, &apple_profile(gib * 2));
            if let (Ok(small), Ok(large)) = (small, large) {
                // RANKED order: earlier is higher quality.
                prop_assert!(large.quantization <= small.quantization);
            }
        }
    }
}
