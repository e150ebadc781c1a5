//! Error taxonomy for reconciler operations.

use std::time::Duration;

use thiserror::Error;

use crate::firewall::FirewallError;
use crate::hypervisor::HypervisorError;
use crate::state::StoreError;

/// Errors surfaced by the reconciler to callers of the control surface.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Bad input shape or range. Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The key is already declared.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The key is not declared.
    #[error("not found: {0}")]
    NotFound(String),

    /// The hypervisor rejected or failed an operation.
    #[error(transparent)]
    Hypervisor(HypervisorError),

    /// The packet filter rejected or failed an operation.
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// A bounded wait elapsed.
    #[error("timed out after {}s: {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    /// The declaration could not be persisted.
    #[error(transparent)]
    Store(StoreError),
}

impl NodeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Hypervisor(_) => "hypervisor_error",
            Self::Firewall(_) => "firewall_error",
            Self::Timeout { .. } => "timeout",
            Self::Store(_) => "persistence_error",
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::Conflict(key) => Self::Conflict(key),
            other => Self::Store(other),
        }
    }
}

impl From<HypervisorError> for NodeError {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::Timeout { what, after } => Self::Timeout { what, after },
            other => Self::Hypervisor(other),
        }
    }
}
