//! Configuration for the node agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Default Ubuntu cloud image used as the backing file for every VM disk.
pub const DEFAULT_BASE_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img";

/// Which host backends the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// libvirt via `virsh` and iptables.
    Host,
    /// In-memory fakes, for development without root.
    Mock,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown backend '{other}' (expected 'host' or 'mock')"),
        }
    }
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP control surface binds to.
    pub listen_addr: SocketAddr,

    /// Directory holding the persisted rule store and domain registry.
    pub data_dir: PathBuf,

    /// Directory where VM images, seeds and overlay disks are written.
    pub work_dir: PathBuf,

    /// The same directory as seen by the hypervisor host, when the agent
    /// runs inside a container. Defaults to `work_dir`.
    pub host_dir: Option<PathBuf>,

    /// libvirt connection URI.
    pub libvirt_uri: String,

    /// Network a VM attaches to when the request does not name one.
    pub default_network: String,

    /// Architecture a VM targets when the request does not name one.
    pub default_arch: String,

    /// Base cloud image URL.
    pub base_image_url: String,

    /// Bridge interface of the VM network.
    pub vm_bridge: String,

    /// Overlay (WireGuard) interface.
    pub overlay_iface: String,

    /// VM subnet, masqueraded towards the external interface.
    pub vm_subnet: String,

    /// External interface. Auto-detected from the default route when unset.
    pub external_iface: Option<String>,

    /// How long to wait for the overlay interface before restoring.
    pub overlay_wait: Duration,

    /// Number of runtime worker threads serving requests.
    pub worker_threads: usize,

    /// Whether the boot pass also reconciles domain power state.
    pub restore_domains: bool,

    /// Host backends or in-memory fakes.
    pub backend: Backend,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("VMNODE_LISTEN_ADDR", "127.0.0.1:8088")
            .parse()
            .context("VMNODE_LISTEN_ADDR must be a socket address")?;

        let data_dir = PathBuf::from(env_or("VMNODE_DATA_DIR", "/var/lib/vmnode"));
        let work_dir = PathBuf::from(env_or("VMNODE_WORK_DIR", "/srv/vms"));
        let host_dir = std::env::var("VMNODE_HOST_DIR").ok().map(PathBuf::from);

        let libvirt_uri = env_or("VMNODE_LIBVIRT_URI", "qemu:///system");
        let default_network = env_or("VMNODE_NETWORK", "default");
        let default_arch = env_or("VMNODE_ARCH", "x86_64");
        let base_image_url = env_or("VMNODE_BASE_IMAGE_URL", DEFAULT_BASE_IMAGE_URL);

        let vm_bridge = env_or("VMNODE_BRIDGE", "virbr0");
        let overlay_iface = env_or("VMNODE_OVERLAY_IFACE", "wg0");
        let vm_subnet = env_or("VMNODE_VM_SUBNET", "192.168.122.0/24");
        let external_iface = std::env::var("VMNODE_EXTERNAL_IFACE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let overlay_wait_secs: u64 = env_parse("VMNODE_OVERLAY_WAIT_SECS")?.unwrap_or(60);

        let worker_threads: usize = env_parse("VMNODE_WORKER_THREADS")?.unwrap_or(4);
        if worker_threads == 0 {
            bail!("VMNODE_WORKER_THREADS must be at least 1");
        }

        let restore_domains = std::env::var("VMNODE_RESTORE_DOMAINS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let backend = env_or("VMNODE_BACKEND", "host").parse()?;

        let log_level = env_or("VMNODE_LOG_LEVEL", "info");

        Ok(Self {
            listen_addr,
            data_dir,
            work_dir,
            host_dir,
            libvirt_uri,
            default_network,
            default_arch,
            base_image_url,
            vm_bridge,
            overlay_iface,
            vm_subnet,
            external_iface,
            overlay_wait: Duration::from_secs(overlay_wait_secs),
            worker_threads,
            restore_domains,
            backend,
            log_level,
        })
    }

    /// Path of the persisted rule store.
    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join("portmap.json")
    }

    /// Path of the persisted domain registry.
    pub fn domains_path(&self) -> PathBuf {
        self.data_dir.join("domains.json")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .ok()
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{key} must be an integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("host".parse::<Backend>().unwrap(), Backend::Host);
        assert_eq!("MOCK".parse::<Backend>().unwrap(), Backend::Mock);
        assert!("qemu".parse::<Backend>().is_err());
    }

    #[test]
    fn test_store_paths() {
        let config = Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: PathBuf::from("/data"),
            work_dir: PathBuf::from("/srv/vms"),
            host_dir: None,
            libvirt_uri: "qemu:///system".to_string(),
            default_network: "default".to_string(),
            default_arch: "x86_64".to_string(),
            base_image_url: DEFAULT_BASE_IMAGE_URL.to_string(),
            vm_bridge: "virbr0".to_string(),
            overlay_iface: "wg0".to_string(),
            vm_subnet: "192.168.122.0/24".to_string(),
            external_iface: None,
            overlay_wait: Duration::from_secs(60),
            worker_threads: 4,
            restore_domains: false,
            backend: Backend::Host,
            log_level: "info".to_string(),
        };

        assert_eq!(config.rules_path(), PathBuf::from("/data/portmap.json"));
        assert_eq!(config.domains_path(), PathBuf::from("/data/domains.json"));
    }
}
