//! Error kinds surfaced to the embedding host.

use thiserror::Error;

/// Everything that can go wrong between a signature table and a native call.
///
/// No partial calls: every variant is raised either at registration/load
/// time or while packing arguments, always before the target function runs.
#[derive(Debug, Clone, Error)]
pub enum FfiError {
    /// A value, type name or signature does not fit what was declared:
    /// wrong arity, wrong managed kind, missing record field, mismatched
    /// pointer tag, unknown type name, `void` in a parameter position or a
    /// duplicate type name.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The shared library or one of the requested symbols could not be
    /// resolved.
    #[error("load failure: {0}")]
    LoadFailure(String),

    /// The signature requires something the ABI engine does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, FfiError>;

impl FfiError {
    pub fn mismatch(msg: impl Into<String>) -> Self {
        FfiError::TypeMismatch(msg.into())
    }

    pub fn load(msg: impl Into<String>) -> Self {
        FfiError::LoadFailure(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        FfiError::Unsupported(msg.into())
    }
}
