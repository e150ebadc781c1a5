//! Default route detection.

use crate::command;

use super::NetworkError;

/// Interface carrying the default route.
pub async fn detect_default_interface() -> Result<String, NetworkError> {
    let output = command::run("ip", &["route", "show", "default"]).await?;
    parse_default_interface(&output).ok_or_else(|| NetworkError::NoDefaultRoute(output.trim().to_string()))
}

/// Pull the device out of `ip route show default` output:
/// `default via 192.168.1.1 dev eth0 proto dhcp metric 100`.
pub fn parse_default_interface(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            parts.position(|p| p == "dev")?;
            parts.next().map(str::to_string)
        })
}
