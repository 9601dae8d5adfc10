//! Error taxonomy surfaced to API callers.
//!
//! Backend seams speak `anyhow`; everything that crosses the public API is
//! mapped into [`Error`] so callers can branch on a stable code without
//! understanding backend internals.

use thiserror::Error;

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Closed error taxonomy for the inference host.
///
/// `Clone` because one failed load is delivered to every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No format classifier matched the artifact.
    #[error("Unrecognized model format at {path}")]
    UnrecognizedFormat { path: String },

    /// A classifier matched but the header or manifest failed validation.
    #[error("Corrupt {format} artifact at {path}: {reason}")]
    CorruptArtifact {
        path: String,
        format: String,
        reason: String,
    },

    /// The model does not fit the memory budget at any quantization level.
    #[error("Insufficient memory: {required} bytes needed at lowest precision, budget is {budget} bytes")]
    InsufficientMemory { required: u64, budget: u64 },

    /// Admission failed because the memory held by busy models cannot be reclaimed.
    #[error("Capacity exceeded: {requested} bytes requested, only {reclaimable} bytes free or reclaimable")]
    CapacityExceeded { requested: u64, reclaimable: u64 },

    /// The model is not loaded (or its load failed).
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    /// No registered backend can load the format or execute the phase.
    #[error("No compatible backend: {detail}")]
    NoCompatibleBackend { detail: String },

    /// The backend loader failed.
    #[error("Failed to load model {model_id}: {cause}")]
    LoadFailed { model_id: String, cause: String },

    /// A single request failed inside the backend engine.
    #[error("Backend execution error: {cause}")]
    BackendExecution { cause: String },

    /// Configuration values are out of range.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Filesystem access failed while inspecting an artifact.
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl Error {
    /// Stable code for the API layer.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnrecognizedFormat { .. } => "unrecognized_format",
            Self::CorruptArtifact { .. } => "corrupt_artifact",
            Self::InsufficientMemory { .. } => "insufficient_memory",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::NoCompatibleBackend { .. } => "no_compatible_backend",
            Self::LoadFailed { .. } => "load_failed",
            Self::BackendExecution { .. } => "backend_execution_error",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Io { .. } => "io_error",
        }
    }

    pub fn model_not_found(model_id: impl Into<String>) -> Self {
        Self::ModelNotFound {
            model_id: model_id.into(),
        }
    }

    pub fn no_backend(detail: impl Into<String>) -> Self {
        Self::NoCompatibleBackend {
            detail: detail.into(),
        }
    }

    pub fn corrupt(
        path: &std::path::Path,
        format: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::CorruptArtifact {
            path: path.display().to_string(),
            format: format.to_string(),
            reason: reason.into(),
        }
    }

    /// Flattens an `anyhow` chain into a backend execution error.
    pub fn execution(cause: &anyhow::Error) -> Self {
        Self::BackendExecution {
            cause: format!("{cause:#}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_variants() -> Vec<Error> {
        vec![
            Error::UnrecognizedFormat { path: "x".into() },
            Error::corrupt(std::path::Path::new("x"), "GGUF", "bad"),
            Error::InsufficientMemory { required: 2, budget: 1 },
            Error::CapacityExceeded { requested: 2, reclaimable: 1 },
            Error::model_not_found("m1"),
            Error::no_backend("onnx"),
            Error::LoadFailed {
                model_id: "m1".into(),
                cause: "boom".into(),
            },
            Error::BackendExecution { cause: "boom".into() },
            Error::InvalidConfig { message: "bad".into() },
            Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")),
        ]
    }

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<_> = all_variants().iter().map(Error::code).collect();
        assert_eq!(codes.len(), all_variants().len());
    }

    #[test]
    fn test_execution_keeps_context_chain() {
        let err = anyhow::anyhow!("socket closed").context("decode request failed");
        let mapped = Error::execution(&err);
        let text = mapped.to_string();
        assert!(text.contains("decode request failed"));
        assert!(text.contains("socket closed"));
    }
}
