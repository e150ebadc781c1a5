//! vmnode Node Agent Library
//!
//! The node agent runs on each host of a private VM mesh. It keeps three
//! things consistent across restarts and partial failures:
//! - declared VM domains and their desired power state
//! - declared TCP port forwards from the node to VM addresses
//! - what the hypervisor and packet filter actually hold
//!
//! ## Modules
//!
//! - `state`: durable rule store and domain registry
//! - `hypervisor`: hypervisor capability trait, libvirt and mock backends
//! - `firewall`: packet filter capability trait, iptables and mock backends
//! - `reconciler`: validate, declare, apply; restore pass
//! - `api`: HTTP control surface

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod firewall;
pub mod hypervisor;
pub mod network;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use error::NodeError;
pub use firewall::MockFirewall;
pub use hypervisor::MockHypervisor;
pub use reconciler::{Reconciler, ReconcilerConfig};
