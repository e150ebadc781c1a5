//! Local state persistence for node agent.
//!
//! Two independent stores hold what this node has declared:
//! - [`RuleStore`]: port-forward rules keyed by listen port
//! - [`DomainRegistry`]: VM specs keyed by name, with desired power state
//!
//! Each store is a JSON file behind its own lock. Every mutation is written
//! through to disk before the in-memory view changes, which lets the agent
//! recover its declared state after restarts.

mod domains;
mod file;
mod rules;

use std::path::PathBuf;

use thiserror::Error;

pub use domains::{DomainRegistry, DomainTable, PowerState, VmSpec};
pub use file::StateFile;
pub use rules::{PortRule, Protocol, RuleStore, RuleTable};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {} is not valid: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file {} has version {found}, expected {expected}", .path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{0} is not declared")]
    NotFound(String),

    #[error("{0} is already declared")]
    Conflict(String),
}
