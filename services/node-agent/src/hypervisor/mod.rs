//! Hypervisor interface and implementations.
//!
//! The reconciler treats the hypervisor as a capability provider: define,
//! start, stop, destroy and query a domain by name, and discover a domain's
//! DHCP lease. Two implementations are provided:
//! - [`VirshHypervisor`]: libvirt through `virsh`, with qcow2 overlays and a
//!   cloud-init seed per domain
//! - [`MockHypervisor`]: in-memory, for tests and development

mod domain_xml;
mod mock;
mod parse;
mod virsh;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::command::CommandError;
use crate::state::VmSpec;

pub use domain_xml::render_domain_xml;
pub use mock::MockHypervisor;
pub use virsh::{VirshConfig, VirshHypervisor};

/// Errors from hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("domain '{0}' is not defined")]
    DomainNotFound(String),

    #[error("network '{0}' is not defined")]
    NetworkNotFound(String),

    #[error("hypervisor command failed: {0}")]
    Command(#[from] CommandError),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("base image download failed: {0}")]
    Download(String),

    #[error("missing prerequisite: {0}")]
    Missing(String),

    #[error("unexpected hypervisor output: {0}")]
    Malformed(String),

    #[error("timed out after {}s waiting for {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("{0}")]
    Other(String),
}

/// Observed power state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Running,
    Stopped,
    /// Not defined, or in a state the agent does not model.
    Unknown,
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Handle to a defined domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: String,
}

/// Hypervisor capability interface.
///
/// Every operation is idempotent with respect to the domain's current state.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Define a domain from the spec and start it.
    ///
    /// A domain that is already defined is started (no-op if running). With
    /// `recreate`, an existing domain is force-stopped, undefined and its
    /// disk artifacts removed first.
    async fn define_and_start(
        &self,
        spec: &VmSpec,
        recreate: bool,
    ) -> Result<DomainHandle, HypervisorError>;

    /// Start a defined domain.
    async fn start(&self, name: &str) -> Result<(), HypervisorError>;

    /// Stop a defined domain.
    async fn stop(&self, name: &str) -> Result<(), HypervisorError>;

    /// Query a domain's power state. Undefined domains report `Unknown`.
    async fn status(&self, name: &str) -> Result<DomainStatus, HypervisorError>;

    /// Force-stop and undefine a domain, optionally removing its disk
    /// artifacts. Succeeds if the domain is already gone.
    async fn destroy(&self, name: &str, delete_files: bool) -> Result<(), HypervisorError>;

    /// Wait for the domain's NIC on `network` to hold a DHCP lease.
    async fn lease_ip(
        &self,
        name: &str,
        network: &str,
        timeout: Duration,
    ) -> Result<Ipv4Addr, HypervisorError>;
}
