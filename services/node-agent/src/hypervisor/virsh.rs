//! libvirt hypervisor backed by `virsh`.
//!
//! Each domain gets a directory under `<work_dir>/instances/<name>/` holding:
//! - `disk.qcow2`: overlay disk backed by the shared base cloud image
//! - `seed.iso`: cloud-init NoCloud seed built from `<work_dir>/configs/`
//! - `domain.xml`: the definition last submitted to libvirt
//!
//! When the agent runs inside a container, `host_dir` names the same work
//! directory as the hypervisor host sees it; domain XML uses host paths.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::command::{self, CommandError};
use crate::config::Config;
use crate::state::VmSpec;

use super::domain_xml::render_domain_xml;
use super::parse;
use super::{DomainHandle, DomainStatus, Hypervisor, HypervisorError};

/// How often the DHCP lease table is polled.
const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a graceful shutdown may take before the domain is forced off.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const BASE_IMAGE_NAME: &str = "base.qcow2";

/// Configuration for the virsh hypervisor.
#[derive(Debug, Clone)]
pub struct VirshConfig {
    /// libvirt connection URI.
    pub uri: String,
    /// Work directory as this process sees it.
    pub work_dir: PathBuf,
    /// Work directory as the hypervisor host sees it.
    pub host_dir: PathBuf,
    /// Base cloud image URL.
    pub base_image_url: String,
}

impl VirshConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            uri: config.libvirt_uri.clone(),
            work_dir: config.work_dir.clone(),
            host_dir: config
                .host_dir
                .clone()
                .unwrap_or_else(|| config.work_dir.clone()),
            base_image_url: config.base_image_url.clone(),
        }
    }
}

/// Hypervisor driving libvirt through the `virsh` CLI.
pub struct VirshHypervisor {
    config: VirshConfig,
    http: reqwest::Client,
}

impl VirshHypervisor {
    pub fn new(config: VirshConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn images_dir(&self) -> PathBuf {
        self.config.work_dir.join("images")
    }

    fn configs_dir(&self) -> PathBuf {
        self.config.work_dir.join("configs")
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.config.work_dir.join("instances").join(name)
    }

    fn host_instance_dir(&self, name: &str) -> PathBuf {
        self.config.host_dir.join("instances").join(name)
    }

    fn base_image_path(&self) -> PathBuf {
        self.images_dir().join(BASE_IMAGE_NAME)
    }

    /// Run `virsh -c <uri> <args>`.
    async fn virsh(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.extend_from_slice(&["-c", self.config.uri.as_str()]);
        full.extend_from_slice(args);
        Ok(command::run("virsh", &full).await?)
    }

    /// Like [`Self::virsh`] for domain commands, mapping libvirt's
    /// "no domain" failure to `DomainNotFound`.
    async fn virsh_domain(&self, name: &str, args: &[&str]) -> Result<String, HypervisorError> {
        match self.virsh(args).await {
            Err(HypervisorError::Command(e)) if is_missing_domain(&e) => {
                Err(HypervisorError::DomainNotFound(name.to_string()))
            }
            other => other,
        }
    }

    async fn ensure_directories(&self) -> Result<(), HypervisorError> {
        for dir in [
            self.images_dir(),
            self.configs_dir(),
            self.config.work_dir.join("instances"),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| HypervisorError::Io { path: dir, source })?;
        }
        Ok(())
    }

    /// Download the base cloud image once.
    async fn ensure_base_image(&self) -> Result<PathBuf, HypervisorError> {
        let dest = self.base_image_path();
        if dest.exists() {
            return Ok(dest);
        }

        info!(url = %self.config.base_image_url, dest = %dest.display(), "Downloading base image");

        let response = self
            .http
            .get(&self.config.base_image_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HypervisorError::Download(e.to_string()))?;

        // Download to temporary file, then rename
        let temp_path = dest.with_extension("part");
        let io_err = |source| HypervisorError::Io {
            path: temp_path.clone(),
            source,
        };
        let mut file = tokio::fs::File::create(&temp_path).await.map_err(io_err)?;

        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HypervisorError::Download(e.to_string()))?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(io_err)?;
        }
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&temp_path, &dest)
            .await
            .map_err(|source| HypervisorError::Io {
                path: dest.clone(),
                source,
            })?;

        info!(size = total, "Base image downloaded");
        Ok(dest)
    }

    /// Make sure the libvirt network exists, is active and autostarts.
    async fn ensure_network_active(&self, network: &str) -> Result<(), HypervisorError> {
        let info = match self.virsh(&["net-info", network]).await {
            Ok(info) => info,
            Err(HypervisorError::Command(CommandError::Failed { .. })) => {
                return Err(HypervisorError::NetworkNotFound(network.to_string()))
            }
            Err(e) => return Err(e),
        };

        if parse::info_field(&info, "Active") != Some("yes") {
            info!(network, "Network inactive, starting");
            self.virsh(&["net-start", network]).await?;
        }

        if parse::info_field(&info, "Autostart") != Some("yes") {
            self.virsh(&["net-autostart", network]).await?;
        }

        Ok(())
    }

    /// Create the qcow2 overlay disk, unless it already exists.
    async fn create_overlay_disk(
        &self,
        spec: &VmSpec,
        base: &Path,
    ) -> Result<PathBuf, HypervisorError> {
        let overlay = self.instance_dir(&spec.name).join("disk.qcow2");
        if overlay.exists() {
            debug!(name = %spec.name, "Reusing existing overlay disk");
            return Ok(overlay);
        }

        // The backing file must be absolute or qemu-img resolves it relative
        // to the overlay.
        let base = tokio::fs::canonicalize(base)
            .await
            .map_err(|source| HypervisorError::Io {
                path: base.to_path_buf(),
                source,
            })?;

        let size = format!("{}G", spec.disk_size_gb);
        info!(name = %spec.name, overlay = %overlay.display(), size = %size, "Creating overlay disk");

        command::run(
            "qemu-img",
            &[
                "create",
                "-f",
                "qcow2",
                "-F",
                "qcow2",
                "-b",
                &base.display().to_string(),
                &overlay.display().to_string(),
                &size,
            ],
        )
        .await?;

        Ok(overlay)
    }

    /// Build the cloud-init seed ISO from `configs/user-data` and
    /// `configs/meta-data`.
    async fn build_seed(&self, spec: &VmSpec) -> Result<PathBuf, HypervisorError> {
        let user_data = self.configs_dir().join("user-data");
        let meta_data = self.configs_dir().join("meta-data");

        for required in [&user_data, &meta_data] {
            if !required.exists() {
                return Err(HypervisorError::Missing(required.display().to_string()));
            }
        }

        let seed = self.instance_dir(&spec.name).join("seed.iso");
        debug!(name = %spec.name, seed = %seed.display(), "Building cloud-init seed");

        command::run(
            "cloud-localds",
            &[
                &seed.display().to_string(),
                &user_data.display().to_string(),
                &meta_data.display().to_string(),
            ],
        )
        .await?;

        Ok(seed)
    }

    async fn handle(&self, name: &str) -> Result<DomainHandle, HypervisorError> {
        let uuid = self.virsh_domain(name, &["domuuid", name]).await?;
        Ok(DomainHandle {
            name: name.to_string(),
            uuid: uuid.trim().to_string(),
        })
    }

    async fn wait_for_status(&self, name: &str, want: DomainStatus, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if matches!(self.status(name).await, Ok(s) if s == want) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        false
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define_and_start(
        &self,
        spec: &VmSpec,
        recreate: bool,
    ) -> Result<DomainHandle, HypervisorError> {
        if recreate {
            self.destroy(&spec.name, true).await?;
        } else {
            match self.status(&spec.name).await? {
                DomainStatus::Running => {
                    debug!(name = %spec.name, "Domain already defined and running");
                    return self.handle(&spec.name).await;
                }
                DomainStatus::Stopped => {
                    self.start(&spec.name).await?;
                    return self.handle(&spec.name).await;
                }
                DomainStatus::Unknown => {}
            }
        }

        self.ensure_directories().await?;
        let base = self.ensure_base_image().await?;
        self.ensure_network_active(&spec.network_name).await?;

        let dir = self.instance_dir(&spec.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| HypervisorError::Io {
                path: dir.clone(),
                source,
            })?;

        self.create_overlay_disk(spec, &base).await?;
        self.build_seed(spec).await?;

        let host_dir = self.host_instance_dir(&spec.name);
        let xml = render_domain_xml(
            spec,
            &host_dir.join("disk.qcow2"),
            &host_dir.join("seed.iso"),
        );
        let xml_path = dir.join("domain.xml");
        tokio::fs::write(&xml_path, xml)
            .await
            .map_err(|source| HypervisorError::Io {
                path: xml_path.clone(),
                source,
            })?;

        info!(name = %spec.name, "Defining domain");
        self.virsh(&["define", &xml_path.display().to_string()])
            .await?;

        info!(name = %spec.name, "Starting domain");
        self.virsh_domain(&spec.name, &["start", &spec.name])
            .await?;

        self.handle(&spec.name).await
    }

    async fn start(&self, name: &str) -> Result<(), HypervisorError> {
        match self.status(name).await? {
            DomainStatus::Running => Ok(()),
            DomainStatus::Unknown => Err(HypervisorError::DomainNotFound(name.to_string())),
            DomainStatus::Stopped => {
                info!(name, "Starting domain");
                self.virsh_domain(name, &["start", name]).await?;
                Ok(())
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<(), HypervisorError> {
        match self.status(name).await? {
            DomainStatus::Stopped => Ok(()),
            DomainStatus::Unknown => Err(HypervisorError::DomainNotFound(name.to_string())),
            DomainStatus::Running => {
                info!(name, "Shutting down domain");
                self.virsh_domain(name, &["shutdown", name]).await?;

                if !self
                    .wait_for_status(name, DomainStatus::Stopped, SHUTDOWN_GRACE)
                    .await
                {
                    warn!(name, "Graceful shutdown timed out, forcing off");
                    self.virsh_domain(name, &["destroy", name]).await?;
                }
                Ok(())
            }
        }
    }

    async fn status(&self, name: &str) -> Result<DomainStatus, HypervisorError> {
        match self.virsh_domain(name, &["domstate", name]).await {
            Ok(out) => Ok(parse::domain_state(&out)),
            Err(HypervisorError::DomainNotFound(_)) => Ok(DomainStatus::Unknown),
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, name: &str, delete_files: bool) -> Result<(), HypervisorError> {
        let status = self.status(name).await?;

        if status == DomainStatus::Running {
            info!(name, "Stopping domain");
            self.virsh_domain(name, &["destroy", name]).await?;
        }

        if status != DomainStatus::Unknown {
            info!(name, "Undefining domain");
            match self.virsh_domain(name, &["undefine", name]).await {
                Ok(_) | Err(HypervisorError::DomainNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if delete_files {
            let dir = self.instance_dir(name);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(name, dir = %dir.display(), "Removed domain files"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(HypervisorError::Io { path: dir, source }),
            }
        }

        Ok(())
    }

    async fn lease_ip(
        &self,
        name: &str,
        network: &str,
        timeout: Duration,
    ) -> Result<Ipv4Addr, HypervisorError> {
        let iflist = self.virsh_domain(name, &["domiflist", name]).await?;
        let mac = parse::interface_mac(&iflist, network).ok_or_else(|| {
            HypervisorError::Malformed(format!("no interface MAC found for domain '{name}'"))
        })?;

        debug!(name, network, mac = %mac, "Waiting for DHCP lease");

        let poll = async {
            loop {
                let leases = self.virsh(&["net-dhcp-leases", network]).await?;
                if let Some(ip) = parse::lease_for_mac(&leases, &mac) {
                    return Ok::<_, HypervisorError>(ip);
                }
                tokio::time::sleep(LEASE_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => {
                let ip = result?;
                info!(name, ip = %ip, "Domain acquired lease");
                Ok(ip)
            }
            Err(_) => Err(HypervisorError::Timeout {
                what: format!("DHCP lease for '{name}' on '{network}'"),
                after: timeout,
            }),
        }
    }
}

fn is_missing_domain(e: &CommandError) -> bool {
    let stderr = e.stderr();
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}
