//! Host network probes.
//!
//! The agent does not configure host networking itself. It only needs to
//! know when the overlay interface is up, since port forwards arriving over
//! the overlay are useless before then, and which interface carries the
//! default route, for masquerading VM egress.

mod overlay;
mod route;

use std::time::Duration;

use thiserror::Error;

use crate::command::CommandError;

pub use overlay::{interface_exists, wait_for_interface};
pub use route::{detect_default_interface, parse_default_interface};

/// Errors from network probes.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("interface {iface} did not appear within {}s", .after.as_secs())]
    InterfaceTimeout { iface: String, after: Duration },

    #[error("failed to query routes: {0}")]
    Command(#[from] CommandError),

    #[error("no default route in: {0}")]
    NoDefaultRoute(String),
}
