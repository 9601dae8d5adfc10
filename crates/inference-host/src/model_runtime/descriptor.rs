//! Identity and static facts of a model artifact.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::path::{Path, PathBuf};

use super::format::ModelFormat;
use super::quantization::Quantization;

/// Stable model identifier (caller supplied or derived from the artifact path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an id from the canonical artifact path.
    pub fn from_path(path: &Path) -> Self {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let digest = blake3::hash(canonical.to_string_lossy().as_bytes());
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        Self(format!("{}-{}", stem, &digest.to_hex()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ModelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Immutable description of a model artifact, created when a load is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: ModelId,
    /// File or directory the loader opens.
    pub path: PathBuf,
    pub format: ModelFormat,
    pub parameter_count: u64,
    pub size_bytes: u64,
    /// Precision the weights are stored at.
    pub native_quantization: Quantization,
}

impl ModelDescriptor {
    /// Builds a descriptor for an artifact whose facts are already known.
    pub fn new(
        id: impl Into<ModelId>,
        path: impl Into<PathBuf>,
        format: ModelFormat,
        parameter_count: u64,
    ) -> Self {
        let native_quantization = format.default_quantization();
        Self {
            id: id.into(),
            path: path.into(),
            format,
            parameter_count,
            size_bytes: native_quantization.estimate_bytes(parameter_count),
            native_quantization,
        }
    }
}
