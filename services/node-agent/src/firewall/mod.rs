//! Packet filter interface and implementations.
//!
//! Every entry the agent installs carries a comment tag so it can be found
//! and removed again without remembering the exact arguments used:
//! - `vmnode:port=<listen_port>` on the entries that forward one port
//! - `vmnode:shared` on the NAT entries all forwards rely on
//!
//! Implementations:
//! - [`IptablesFirewall`]: iptables through the `iptables` binary
//! - [`MockFirewall`]: in-memory, for tests and development

mod iptables;
mod mock;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::CommandError;
use crate::state::PortRule;

pub use iptables::{IptablesConfig, IptablesFirewall};
pub use mock::MockFirewall;

/// Tag on entries shared by all forwards.
pub const SHARED_TAG: &str = "vmnode:shared";

const PORT_TAG_PREFIX: &str = "vmnode:port=";

/// Tag on the entries belonging to one listen port.
pub fn port_tag(listen_port: u16) -> String {
    format!("{PORT_TAG_PREFIX}{listen_port}")
}

/// Parse a port tag back into its listen port.
pub fn parse_port_tag(tag: &str) -> Option<u16> {
    tag.strip_prefix(PORT_TAG_PREFIX)?.parse().ok()
}

/// Errors from packet filter operations.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("packet filter command failed: {0}")]
    Command(#[from] CommandError),

    #[error("could not read packet filter state: {0}")]
    Listing(String),

    #[error("{0}")]
    Other(String),
}

/// Packet filter capability interface.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Install the entries that forward `rule.listen_port` to its target.
    ///
    /// Entries previously tagged for the same port are removed first, so
    /// installing twice leaves exactly one set and a changed target replaces
    /// the old one.
    async fn install(&self, rule: &PortRule) -> Result<(), FirewallError>;

    /// Remove every entry tagged for `listen_port`. Succeeds when none exist.
    async fn remove(&self, listen_port: u16) -> Result<(), FirewallError>;

    /// Listen ports that currently have a forwarding entry installed.
    async fn list_installed(&self) -> Result<BTreeSet<u16>, FirewallError>;
}
