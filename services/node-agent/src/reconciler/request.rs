//! Control-surface requests and their validation.
//!
//! Numeric fields arrive as `i64` so out-of-range values are reported as
//! validation failures instead of being rejected by the JSON extractor.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::error::NodeError;
use crate::state::{PortRule, PowerState, Protocol, VmSpec};

use super::ReconcilerConfig;

pub const DEFAULT_MEMORY_MIB: u32 = 1024;
pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_DISK_SIZE_GB: u32 = 10;

/// Bounds on a caller-supplied lease wait, in seconds.
pub const IP_TIMEOUT_RANGE: std::ops::RangeInclusive<i64> = 1..=3600;

const MAX_NAME_LEN: usize = 63;
const MAX_LABEL_LEN: usize = 64;

/// Request to declare and boot a VM.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateVmRequest {
    #[serde(default)]
    pub name: String,
    pub memory_mib: Option<i64>,
    pub vcpus: Option<i64>,
    pub disk_size_gb: Option<i64>,
    pub network_name: Option<String>,
    pub os_arch: Option<String>,
    #[serde(default)]
    pub recreate: bool,
}

impl CreateVmRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validate the request and fill in defaults.
    pub fn validate(&self, defaults: &ReconcilerConfig) -> Result<VmSpec, NodeError> {
        validate_name(&self.name)?;

        let network_name = match &self.network_name {
            Some(network) => validate_label("network_name", network)?,
            None => defaults.default_network.clone(),
        };
        let os_arch = match &self.os_arch {
            Some(arch) => validate_label("os_arch", arch)?,
            None => defaults.default_arch.clone(),
        };

        Ok(VmSpec {
            name: self.name.clone(),
            memory_mib: positive("memory_mib", self.memory_mib, DEFAULT_MEMORY_MIB)?,
            vcpus: positive("vcpus", self.vcpus, DEFAULT_VCPUS)?,
            disk_size_gb: positive("disk_size_gb", self.disk_size_gb, DEFAULT_DISK_SIZE_GB)?,
            network_name,
            os_arch,
            desired_power_state: PowerState::Running,
            created_at: Utc::now(),
        })
    }
}

fn default_proto() -> String {
    Protocol::Tcp.as_str().to_string()
}

/// Request to declare a port forward.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePortRuleRequest {
    #[serde(default)]
    pub listen_port: i64,
    #[serde(default)]
    pub target_ip: String,
    #[serde(default)]
    pub target_port: i64,
    #[serde(default = "default_proto")]
    pub proto: String,
}

impl CreatePortRuleRequest {
    pub fn tcp(listen_port: i64, target_ip: impl Into<String>, target_port: i64) -> Self {
        Self {
            listen_port,
            target_ip: target_ip.into(),
            target_port,
            proto: default_proto(),
        }
    }

    pub fn validate(&self) -> Result<PortRule, NodeError> {
        if !self.proto.trim().eq_ignore_ascii_case(Protocol::Tcp.as_str()) {
            return Err(NodeError::validation(format!(
                "proto '{}' is not supported, only tcp",
                self.proto
            )));
        }

        let listen_port = validate_port("listen_port", self.listen_port)?;
        let target_port = validate_port("target_port", self.target_port)?;
        let target_ip = validate_target_ip(&self.target_ip)?;

        Ok(PortRule::new(listen_port, target_ip, target_port))
    }
}

/// VM names: `[A-Za-z0-9][A-Za-z0-9_.-]{0,62}`.
pub fn validate_name(name: &str) -> Result<(), NodeError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(NodeError::validation("name is required"));
    };

    if name.len() > MAX_NAME_LEN {
        return Err(NodeError::validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !first.is_ascii_alphanumeric() {
        return Err(NodeError::validation(
            "name must start with a letter or digit",
        ));
    }
    if !chars.all(is_label_char) {
        return Err(NodeError::validation(
            "name may only contain letters, digits, '_', '.' and '-'",
        ));
    }
    Ok(())
}

/// Network and architecture names are passed to host tools, so they are
/// held to the same character set as VM names.
pub fn validate_label(field: &str, value: &str) -> Result<String, NodeError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(NodeError::validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_LABEL_LEN || !value.chars().all(is_label_char) {
        return Err(NodeError::validation(format!(
            "{field} '{value}' is not a valid name"
        )));
    }
    Ok(value.to_string())
}

pub fn validate_port(field: &str, port: i64) -> Result<u16, NodeError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| NodeError::validation(format!("{field} must be between 1 and 65535")))
}

/// Parse a port given as text, e.g. from a URL path.
pub fn parse_port(field: &str, raw: &str) -> Result<u16, NodeError> {
    let port = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| NodeError::validation(format!("{field} must be a number")))?;
    validate_port(field, port)
}

fn validate_target_ip(raw: &str) -> Result<Ipv4Addr, NodeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(NodeError::validation("target_ip is required"));
    }

    let ip: Ipv4Addr = raw
        .parse()
        .map_err(|_| NodeError::validation(format!("target_ip '{raw}' is not an IPv4 address")))?;

    if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        return Err(NodeError::validation(format!(
            "target_ip '{ip}' is not a unicast address"
        )));
    }
    Ok(ip)
}

/// Resolve the lease wait for an IP lookup.
pub fn ip_timeout(requested: Option<i64>, default: Duration) -> Result<Duration, NodeError> {
    match requested {
        None => Ok(default),
        Some(secs) if IP_TIMEOUT_RANGE.contains(&secs) => Ok(Duration::from_secs(secs as u64)),
        Some(_) => Err(NodeError::validation(format!(
            "timeout must be between {} and {} seconds",
            IP_TIMEOUT_RANGE.start(),
            IP_TIMEOUT_RANGE.end()
        ))),
    }
}

fn positive(field: &str, value: Option<i64>, default: u32) -> Result<u32, NodeError> {
    match value {
        None => Ok(default),
        Some(v) => u32::try_from(v)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| NodeError::validation(format!("{field} must be a positive integer"))),
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}
