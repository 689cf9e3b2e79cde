//! Error taxonomy shared by the command-graph layer and its back ends.

use thiserror::Error;

/// Errors surfaced across the gantry public API.
///
/// Usage errors (`InvalidOperation`, `InvalidValue`, `InvalidSize`,
/// `InvalidWorkDimension`) leave the object they were called on unchanged.
/// `UnsupportedFeature` reports a capability gap in the selected back end.
/// `Adapter` carries a back-end-specific failure message so callers can
/// distinguish their own misuse from a misbehaving driver model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("invalid work dimension {0} (expected 1..=3)")]
    InvalidWorkDimension(u32),

    #[error("unsupported feature on {backend} backend: {feature}")]
    UnsupportedFeature { backend: &'static str, feature: String },

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("{backend} adapter error: {message}")]
    Adapter { backend: &'static str, message: String },
}

impl Error {
    /// Shorthand for a capability-gap error.
    pub fn unsupported(backend: &'static str, feature: impl Into<String>) -> Self {
        Self::UnsupportedFeature { backend, feature: feature.into() }
    }

    /// Shorthand for a back-end-specific failure.
    pub fn adapter(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Adapter { backend, message: message.into() }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Check that `dim` is a legal ND-range dimensionality.
pub fn check_work_dim(dim: u32) -> Result<()> {
    if (1..=3).contains(&dim) {
        Ok(())
    } else {
        Err(Error::InvalidWorkDimension(dim))
    }
}
