//! Parsers for `virsh` table output.

use std::net::Ipv4Addr;

use super::DomainStatus;

/// Map `virsh domstate` output to a status.
pub fn domain_state(output: &str) -> DomainStatus {
    match output.trim() {
        "running" | "idle" | "paused" | "in shutdown" | "blocked" => DomainStatus::Running,
        "shut off" | "crashed" | "pmsuspended" => DomainStatus::Stopped,
        _ => DomainStatus::Unknown,
    }
}

/// Find the MAC of the domain's interface attached to `network` in
/// `virsh domiflist` output.
///
/// ```text
///  Interface   Type      Source    Model    MAC
/// -------------------------------------------------------------
///  vnet0       network   default   virtio   52:54:00:aa:bb:cc
/// ```
///
/// Falls back to the first interface when none names the network.
pub fn interface_mac(output: &str, network: &str) -> Option<String> {
    let mut first = None;

    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let Some(mac) = cols.iter().copied().find(|c| is_mac(c)) else {
            continue;
        };
        let mac = mac.to_lowercase();

        if cols.contains(&network) {
            return Some(mac);
        }
        first.get_or_insert(mac);
    }

    first
}

/// Find the IPv4 lease for `mac` in `virsh net-dhcp-leases` output.
///
/// ```text
///  Expiry Time           MAC address         Protocol   IP address           Hostname
/// ------------------------------------------------------------------------------------
///  2024-01-01 12:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.50/24    vm1
/// ```
pub fn lease_for_mac(output: &str, mac: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .any(|c| c.eq_ignore_ascii_case(mac))
        })
        .flat_map(|line| line.split_whitespace())
        .filter_map(|c| c.split('/').next())
        .find_map(|c| c.parse::<Ipv4Addr>().ok())
}

/// Read a `Key: value` field from `virsh net-info` / `dominfo` output.
pub fn info_field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMIFLIST: &str = " Interface   Type      Source    Model    MAC
-------------------------------------------------------------
 vnet3       bridge    br-ext    virtio   52:54:00:11:22:33
 vnet4       network   default   virtio   52:54:00:AA:BB:CC
";

    const LEASES: &str = " Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID
------------------------------------------------------------------------------------------------------------
 2024-01-01 12:00:00   52:54:00:11:22:33   ipv4       192.168.122.40/24    other      -
 2024-01-01 12:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.50/24    vm1        -
";

    #[test]
    fn test_domain_state() {
        assert_eq!(domain_state("running\n\n"), DomainStatus::Running);
        assert_eq!(domain_state("shut off\n"), DomainStatus::Stopped);
        assert_eq!(domain_state("nosuchstate"), DomainStatus::Unknown);
    }

    #[test]
    fn test_interface_mac_prefers_network() {
        assert_eq!(
            interface_mac(DOMIFLIST, "default").as_deref(),
            Some("52:54:00:aa:bb:cc")
        );
        assert_eq!(
            interface_mac(DOMIFLIST, "elsewhere").as_deref(),
            Some("52:54:00:11:22:33")
        );
        assert_eq!(interface_mac("no interfaces\n", "default"), None);
    }

    #[test]
    fn test_lease_for_mac() {
        assert_eq!(
            lease_for_mac(LEASES, "52:54:00:aa:bb:cc"),
            Some(Ipv4Addr::new(192, 168, 122, 50))
        );
        assert_eq!(lease_for_mac(LEASES, "52:54:00:ff:ff:ff"), None);
    }

    #[test]
    fn test_info_field() {
        let out = "Name:           default\nActive:         yes\nAutostart:      no\n";
        assert_eq!(info_field(out, "Active"), Some("yes"));
        assert_eq!(info_field(out, "Autostart"), Some("no"));
        assert_eq!(info_field(out, "Bridge"), None);
    }
}
