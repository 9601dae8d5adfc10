//! Hardware capability profiling.
//!
//! The profiler is the single source of hardware facts; all other components
//! consume immutable [`HardwareProfile`] snapshots.

pub mod probe;
pub mod profile;
pub mod profiler;

pub use probe::{FixedProbe, HardwareProbe, SystemProbe};
pub use profile::{ChipTier, HardwareProfile};
pub use profiler::{HardwareProfiler, RefreshTask};
