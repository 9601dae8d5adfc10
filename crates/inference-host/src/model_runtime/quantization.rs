//! Weight precision levels and their memory cost.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::format::ModelFormat;

/// Weight precision, ordered highest quality first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quantization {
    F32,
    F16,
    Q8_0,
    Q6K,
    Q5KM,
    Q4KM,
    Q3KM,
    Q2K,
}

impl Quantization {
    /// Every level, highest quality first.
    pub const RANKED: [Quantization; 8] = [
        Quantization::F32,
        Quantization::F16,
        Quantization::Q8_0,
        Quantization::Q6K,
        Quantization::Q5KM,
        Quantization::Q4KM,
        Quantization::Q3KM,
        Quantization::Q2K,
    ];

    /// Average storage cost per weight including block scales.
    pub fn bits_per_weight(&self) -> f64 {
        match self {
            Quantization::F32 => 32.0,
            Quantization::F16 => 16.0,
            Quantization::Q8_0 => 8.5,
            Quantization::Q6K => 6.5625,
            Quantization::Q5KM => 5.5,
            Quantization::Q4KM => 4.5,
            Quantization::Q3KM => 3.5,
            Quantization::Q2K => 2.625,
        }
    }

    pub fn bytes_per_weight(&self) -> f64 {
        self.bits_per_weight() / 8.0
    }

    /// Resident weight bytes for `parameters` weights at this precision.
    pub fn estimate_bytes(&self, parameters: u64) -> u64 {
        (parameters as f64 * self.bytes_per_weight()).ceil() as u64
    }

    /// Levels a load may choose from, highest quality first: the artifact's
    /// stored precision followed by any lower precision the format's loaders
    /// can produce on the fly.
    pub fn candidates(format: ModelFormat, native: Quantization) -> Vec<Quantization> {
        let mut levels = vec![native];
        levels.extend(
            format
                .load_time_quantizations()
                .iter()
                .copied()
                .filter(|level| *level > native),
        );
        levels.sort();
        levels.dedup();
        levels
    }

    pub fn label(&self) -> &'static str {
        match self {
            Quantization::F32 => "F32",
            Quantization::F16 => "F16",
            Quantization::Q8_0 => "Q8_0",
            Quantization::Q6K => "Q6_K",
            Quantization::Q5KM => "Q5_K_M",
            Quantization::Q4KM => "Q4_K_M",
            Quantization::Q3KM => "Q3_K_M",
            Quantization::Q2K => "Q2_K",
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
