//! Immutable snapshot of the host's compute capability.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::model_runtime::TargetKind;

const GIB: u64 = 1024 * 1024 * 1024;

/// Coarse performance class of the host chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipTier {
    /// Unidentified hardware, treated as the lowest tier.
    Unknown,
    Base,
    Pro,
    Max,
    Ultra,
}

impl ChipTier {
    /// Classifies a CPU brand string such as `Apple M2 Pro`.
    pub fn from_brand(brand: &str) -> Self {
        static APPLE: OnceLock<Regex> = OnceLock::new();
        let apple = APPLE.get_or_init(|| {
            Regex::new(r"Apple M\d+(?:\s+(Pro|Max|Ultra))?").expect("static regex")
        });

        match apple.captures(brand) {
            Some(caps) => match caps.get(1).map(|m| m.as_str()) {
                Some("Pro") => ChipTier::Pro,
                Some("Max") => ChipTier::Max,
                Some("Ultra") => ChipTier::Ultra,
                _ => ChipTier::Base,
            },
            None if brand.trim().is_empty() => ChipTier::Unknown,
            None => ChipTier::Base,
        }
    }

    /// Nominal integrated GPU core count for Apple silicon tiers.
    pub fn nominal_gpu_cores(&self) -> u32 {
        match self {
            ChipTier::Unknown => 0,
            ChipTier::Base => 8,
            ChipTier::Pro => 16,
            ChipTier::Max => 32,
            ChipTier::Ultra => 64,
        }
    }
}

/// Per-process hardware snapshot. Refreshed periodically, never per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub chip_family: String,
    pub chip_tier: ChipTier,
    pub performance_cores: u32,
    pub efficiency_cores: u32,
    pub gpu_cores: u32,
    pub has_neural_accelerator: bool,
    pub total_memory_bytes: u64,
    /// 0 means fully throttled, 100 means cool.
    pub thermal_headroom: u8,
    pub captured_at: DateTime<Utc>,
}

impl HardwareProfile {
    /// Conservative profile used when hardware queries fail.
    pub fn fallback() -> Self {
        Self {
            chip_family: "unknown".to_string(),
            chip_tier: ChipTier::Unknown,
            performance_cores: 1,
            efficiency_cores: 0,
            gpu_cores: 0,
            has_neural_accelerator: false,
            total_memory_bytes: 4 * GIB,
            thermal_headroom: 100,
            captured_at: Utc::now(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.chip_tier == ChipTier::Unknown && self.chip_family == "unknown"
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_cores > 0
    }

    /// Whether an execution target of this kind exists on the host.
    pub fn supports(&self, kind: TargetKind) -> bool {
        match kind {
            TargetKind::Cpu => true,
            TargetKind::Gpu => self.has_gpu(),
            TargetKind::NeuralAccelerator => self.has_neural_accelerator,
        }
    }

    pub fn total_cores(&self) -> u32 {
        self.performance_cores + self.efficiency_cores
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / GIB as f64
    }
}
