//! Model artifact formats understood by the host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::quantization::Quantization;

/// Closed set of on-disk model representations.
///
/// Declaration order doubles as the final tie-break when two classifiers
/// match a directory with equal specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// Packed quantized GGUF (llama.cpp).
    Gguf,
    /// Safetensors tensor container.
    Safetensors,
    /// Array-framework native weights (MLX).
    Mlx,
    /// Neural accelerator package (Core ML).
    CoreMl,
    /// ONNX graph.
    Onnx,
    /// Framework checkpoint (PyTorch pickle or zip).
    Checkpoint,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 6] = [
        ModelFormat::Gguf,
        ModelFormat::Safetensors,
        ModelFormat::Mlx,
        ModelFormat::CoreMl,
        ModelFormat::Onnx,
        ModelFormat::Checkpoint,
    ];

    /// File extensions conventionally used by the format.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ModelFormat::Gguf => &["gguf"],
            ModelFormat::Safetensors => &["safetensors"],
            ModelFormat::Mlx => &["npz"],
            ModelFormat::CoreMl => &["mlmodel", "mlpackage", "mlmodelc"],
            ModelFormat::Onnx => &["onnx"],
            ModelFormat::Checkpoint => &["pt", "pth", "bin", "ckpt"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelFormat::Gguf => "GGUF",
            ModelFormat::Safetensors => "Safetensors",
            ModelFormat::Mlx => "MLX",
            ModelFormat::CoreMl => "Core ML",
            ModelFormat::Onnx => "ONNX",
            ModelFormat::Checkpoint => "PyTorch checkpoint",
        }
    }

    /// Storage precision assumed when the artifact does not declare one.
    pub fn default_quantization(&self) -> Quantization {
        match self {
            ModelFormat::Gguf => Quantization::Q4KM,
            ModelFormat::Safetensors | ModelFormat::Mlx | ModelFormat::CoreMl => Quantization::F16,
            ModelFormat::Onnx | ModelFormat::Checkpoint => Quantization::F32,
        }
    }

    /// Precisions a loader for this format can produce at load time without
    /// converting the artifact on disk.
    pub fn load_time_quantizations(&self) -> &'static [Quantization] {
        match self {
            // Pre-quantized or compiled: loaded exactly as stored.
            ModelFormat::Gguf | ModelFormat::CoreMl | ModelFormat::Onnx => &[],
            ModelFormat::Safetensors | ModelFormat::Mlx => {
                &[Quantization::F16, Quantization::Q8_0, Quantization::Q4KM]
            }
            ModelFormat::Checkpoint => &[Quantization::F16, Quantization::Q8_0],
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gguf" => Ok(ModelFormat::Gguf),
            "safetensors" => Ok(ModelFormat::Safetensors),
            "mlx" | "npz" => Ok(ModelFormat::Mlx),
            "coreml" | "core_ml" | "mlpackage" => Ok(ModelFormat::CoreMl),
            "onnx" => Ok(ModelFormat::Onnx),
            "checkpoint" | "pytorch" | "torch" => Ok(ModelFormat::Checkpoint),
            other => Err(anyhow::anyhow!("unknown model format: {}", other)),
        }
    }
}
