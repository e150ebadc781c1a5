//! iptables packet filter.
//!
//! Per-port entries:
//! - `nat/PREROUTING` (prepended): DNAT `listen_port` to `target_ip:target_port`
//! - `filter/FORWARD` (prepended): accept traffic to the target
//! - `nat/POSTROUTING`: MASQUERADE towards the VM bridge so replies return here
//!
//! Shared entries, ensured on every install and dropped with the last port:
//! - `filter/FORWARD`: accept RELATED,ESTABLISHED
//! - `nat/POSTROUTING`: MASQUERADE out of the overlay interface
//! - `nat/POSTROUTING`: MASQUERADE the VM subnet out of the external interface
//!
//! Deletion reads `iptables -S` and replays each tagged line with `-A`
//! swapped for `-D`, so entries are removed exactly as the kernel holds them.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::command;
use crate::config::Config;
use crate::network;
use crate::state::PortRule;

use super::{parse_port_tag, port_tag, Firewall, FirewallError, SHARED_TAG};

const IPTABLES: &str = "iptables";
const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Chains the agent writes to, as (table, chain).
const MANAGED_CHAINS: [(&str, &str); 3] = [
    ("nat", "PREROUTING"),
    ("filter", "FORWARD"),
    ("nat", "POSTROUTING"),
];

/// Where an entry goes in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    First,
    Last,
}

/// One packet filter entry, without the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    table: &'static str,
    chain: &'static str,
    placement: Placement,
    matches: Vec<String>,
}

impl Entry {
    fn new(table: &'static str, chain: &'static str, placement: Placement, matches: &[&str]) -> Self {
        Self {
            table,
            chain,
            placement,
            matches: matches.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Match arguments with the comment tag spliced in before the target.
    fn tagged(&self, tag: &str) -> Vec<String> {
        let target = self
            .matches
            .iter()
            .position(|a| a == "-j")
            .unwrap_or(self.matches.len());

        let mut args = self.matches[..target].to_vec();
        args.extend(["-m", "comment", "--comment", tag].map(String::from));
        args.extend_from_slice(&self.matches[target..]);
        args
    }

    fn insert_args(&self, tag: &str) -> Vec<String> {
        let mut args = vec!["-w".to_string(), "-t".to_string(), self.table.to_string()];
        match self.placement {
            Placement::First => args.extend(["-I".to_string(), self.chain.to_string(), "1".to_string()]),
            Placement::Last => args.extend(["-A".to_string(), self.chain.to_string()]),
        }
        args.extend(self.tagged(tag));
        args
    }

    fn check_args(&self, tag: &str) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            self.table.to_string(),
            "-C".to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.tagged(tag));
        args
    }
}

/// Entries forwarding one port.
fn port_entries(rule: &PortRule, bridge: &str) -> Vec<Entry> {
    let proto = rule.proto.as_str();
    let listen = rule.listen_port.to_string();
    let target_ip = rule.target_ip.to_string();
    let target_port = rule.target_port.to_string();
    let destination = format!("{}:{}", rule.target_ip, rule.target_port);

    vec![
        Entry::new(
            "nat",
            "PREROUTING",
            Placement::First,
            &["-p", proto, "--dport", &listen, "-j", "DNAT", "--to-destination", &destination],
        ),
        Entry::new(
            "filter",
            "FORWARD",
            Placement::First,
            &["-p", proto, "-d", &target_ip, "--dport", &target_port, "-j", "ACCEPT"],
        ),
        Entry::new(
            "nat",
            "POSTROUTING",
            Placement::Last,
            &[
                "-o", bridge, "-p", proto, "-d", &target_ip, "--dport", &target_port, "-j",
                "MASQUERADE",
            ],
        ),
    ]
}

/// Entries shared by all forwards. The subnet masquerade is skipped when no
/// external interface is known.
fn shared_entries(overlay_iface: &str, vm_subnet: &str, external_iface: Option<&str>) -> Vec<Entry> {
    let mut entries = vec![
        Entry::new(
            "filter",
            "FORWARD",
            Placement::First,
            &["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
        ),
        Entry::new(
            "nat",
            "POSTROUTING",
            Placement::Last,
            &["-o", overlay_iface, "-j", "MASQUERADE"],
        ),
    ];

    if let Some(external) = external_iface {
        entries.push(Entry::new(
            "nat",
            "POSTROUTING",
            Placement::First,
            &["-s", vm_subnet, "-o", external, "-j", "MASQUERADE"],
        ));
    }

    entries
}

/// Split an `iptables -S` line into arguments, dropping the quotes iptables
/// puts around comments.
fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace()
        .map(|t| t.trim_matches('"').to_string())
        .collect()
}

/// Comment tag of an `iptables -S` line, if any.
fn line_tag(tokens: &[String]) -> Option<&str> {
    tokens
        .windows(2)
        .find(|w| w[0] == "--comment")
        .map(|w| w[1].as_str())
}

/// Listen ports tagged on the lines of `iptables -S` output.
fn parse_tagged_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| line_tag(&tokenize(line)).and_then(parse_port_tag))
        .collect()
}

/// Turn an `iptables -S` line carrying `tag` into the arguments deleting it.
fn delete_args(table: &str, line: &str, tag: &str) -> Option<Vec<String>> {
    let mut tokens = tokenize(line);
    if tokens.first().map(String::as_str) != Some("-A") || line_tag(&tokens) != Some(tag) {
        return None;
    }
    tokens[0] = "-D".to_string();

    let mut args = vec!["-w".to_string(), "-t".to_string(), table.to_string()];
    args.extend(tokens);
    Some(args)
}

/// Settings for [`IptablesFirewall`].
#[derive(Debug, Clone)]
pub struct IptablesConfig {
    pub bridge: String,
    pub overlay_iface: String,
    pub vm_subnet: String,
    /// Detected from the default route when unset.
    pub external_iface: Option<String>,
}

impl IptablesConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bridge: config.vm_bridge.clone(),
            overlay_iface: config.overlay_iface.clone(),
            vm_subnet: config.vm_subnet.clone(),
            external_iface: config.external_iface.clone(),
        }
    }
}

/// iptables-backed packet filter.
pub struct IptablesFirewall {
    config: IptablesConfig,
    external_iface: OnceCell<Option<String>>,
}

impl IptablesFirewall {
    pub fn new(config: IptablesConfig) -> Self {
        Self {
            config,
            external_iface: OnceCell::new(),
        }
    }

    async fn iptables(&self, args: &[String]) -> Result<String, FirewallError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(command::run(IPTABLES, &args).await?)
    }

    async fn list_chain(&self, table: &str, chain: &str) -> Result<String, FirewallError> {
        command::run(IPTABLES, &["-w", "-t", table, "-S", chain])
            .await
            .map_err(|e| FirewallError::Listing(format!("{table}/{chain}: {e}")))
    }

    async fn external_iface(&self) -> Option<String> {
        self.external_iface
            .get_or_init(|| async {
                if let Some(iface) = &self.config.external_iface {
                    return Some(iface.clone());
                }
                match network::detect_default_interface().await {
                    Ok(iface) => {
                        info!(iface = %iface, "Detected external interface");
                        Some(iface)
                    }
                    Err(e) => {
                        warn!(error = %e, "No external interface; VM subnet will not be masqueraded");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Delete every entry tagged `tag` in the managed chains.
    async fn delete_tagged(&self, tag: &str) -> Result<usize, FirewallError> {
        let mut deleted = 0;

        for (table, chain) in MANAGED_CHAINS {
            let listing = self.list_chain(table, chain).await?;
            for line in listing.lines() {
                if let Some(args) = delete_args(table, line, tag) {
                    self.iptables(&args).await?;
                    deleted += 1;
                }
            }
        }

        if deleted > 0 {
            debug!(tag, deleted, "Deleted tagged entries");
        }
        Ok(deleted)
    }

    async fn ensure_shared(&self) -> Result<(), FirewallError> {
        enable_ip_forward().await;

        let external = self.external_iface().await;
        let entries = shared_entries(
            &self.config.overlay_iface,
            &self.config.vm_subnet,
            external.as_deref(),
        );

        for entry in entries {
            let check = entry.check_args(SHARED_TAG);
            let check: Vec<&str> = check.iter().map(String::as_str).collect();
            if command::succeeds(IPTABLES, &check).await? {
                continue;
            }
            self.iptables(&entry.insert_args(SHARED_TAG)).await?;
            debug!(table = entry.table, chain = entry.chain, "Installed shared entry");
        }

        Ok(())
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn install(&self, rule: &PortRule) -> Result<(), FirewallError> {
        let tag = port_tag(rule.listen_port);

        self.delete_tagged(&tag).await?;
        self.ensure_shared().await?;

        for entry in port_entries(rule, &self.config.bridge) {
            self.iptables(&entry.insert_args(&tag)).await?;
        }

        info!(
            listen_port = rule.listen_port,
            target = %format!("{}:{}", rule.target_ip, rule.target_port),
            "Installed port forward"
        );
        Ok(())
    }

    async fn remove(&self, listen_port: u16) -> Result<(), FirewallError> {
        let deleted = self.delete_tagged(&port_tag(listen_port)).await?;
        info!(listen_port, deleted, "Removed port forward");

        if self.list_installed().await?.is_empty() {
            let shared = self.delete_tagged(SHARED_TAG).await?;
            if shared > 0 {
                info!(deleted = shared, "No forwards left, removed shared NAT entries");
            }
        }
        Ok(())
    }

    async fn list_installed(&self) -> Result<BTreeSet<u16>, FirewallError> {
        let listing = self.list_chain("nat", "PREROUTING").await?;
        Ok(parse_tagged_ports(&listing))
    }
}

/// Turn on IPv4 forwarding. Failure is logged and ignored since forwarding
/// may already be managed by the host.
async fn enable_ip_forward() {
    if let Err(e) = tokio::fs::write(IP_FORWARD_PATH, "1\n").await {
        warn!(error = %e, "Could not enable IPv4 forwarding");
    }
}
