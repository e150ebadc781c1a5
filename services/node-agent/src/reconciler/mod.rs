//! Reconciler for converging node state.
//!
//! Every mutating request moves through validate, declare, apply:
//! - validation failures are rejected before any store or host side effect
//! - port rules are declared (persisted) first and then installed
//! - VMs are defined on the hypervisor first and then recorded, so the
//!   registry only holds domains the hypervisor has accepted
//!
//! An apply failure is returned to the caller but the declaration stays. A
//! retry of the same call, or the restore pass, converges it later.
//!
//! Each store's write lock is held across the whole validate-persist-apply
//! sequence. Lease lookups run without any lock held.

mod report;
mod request;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use vmnode_reconcile::{BatchReport, ConvergenceStatus, KeyDiff};

use crate::config::Config;
use crate::error::NodeError;
use crate::firewall::Firewall;
use crate::hypervisor::{DomainStatus, Hypervisor};
use crate::state::{DomainRegistry, PortRule, PowerState, RuleStore, VmSpec};

pub use report::{BootReport, DomainOutcome, DomainSummary, RestoreSummary};
pub use request::{parse_port, CreatePortRuleRequest, CreateVmRequest};

use request::{ip_timeout, validate_label};

/// Extra time the reconciler grants a lease lookup beyond the caller's
/// timeout before abandoning it.
const LEASE_GRACE: Duration = Duration::from_secs(1);

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Network a VM attaches to when the request names none.
    pub default_network: String,

    /// Architecture a VM targets when the request names none.
    pub default_arch: String,

    /// Lease wait when the caller gives no timeout.
    pub ip_timeout: Duration,

    /// Whether `restore` also reconciles domain power state.
    pub restore_domains: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            default_network: "default".to_string(),
            default_arch: "x86_64".to_string(),
            ip_timeout: Duration::from_secs(120),
            restore_domains: false,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_network: config.default_network.clone(),
            default_arch: config.default_arch.clone(),
            restore_domains: config.restore_domains,
            ..Self::default()
        }
    }
}

/// Observed and desired state of one declared VM.
#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    pub name: String,
    pub state: DomainStatus,
    pub desired: PowerState,
}

/// Reconciler for converging node state.
pub struct Reconciler {
    rules: Arc<RuleStore>,
    domains: Arc<DomainRegistry>,
    hypervisor: Arc<dyn Hypervisor>,
    firewall: Arc<dyn Firewall>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        rules: Arc<RuleStore>,
        domains: Arc<DomainRegistry>,
        hypervisor: Arc<dyn Hypervisor>,
        firewall: Arc<dyn Firewall>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            rules,
            domains,
            hypervisor,
            firewall,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    // ---- VMs ----

    /// Define and boot a VM, then record it.
    ///
    /// If the hypervisor fails after the domain came into existence, the
    /// spec is still recorded so the registry keeps tracking it.
    pub async fn create_vm(&self, request: CreateVmRequest) -> Result<VmSpec, NodeError> {
        let spec = request.validate(&self.config)?;
        let recreate = request.recreate;

        let mut domains = self.domains.write().await;
        if !recreate && domains.contains(&spec.name) {
            return Err(NodeError::Conflict(format!("vm {}", spec.name)));
        }

        info!(
            name = %spec.name,
            memory_mib = spec.memory_mib,
            vcpus = spec.vcpus,
            disk_size_gb = spec.disk_size_gb,
            network = %spec.network_name,
            recreate,
            "Creating VM"
        );

        match self.hypervisor.define_and_start(&spec, recreate).await {
            Ok(handle) => {
                let spec = domains.put(spec, true)?;
                info!(name = %spec.name, uuid = %handle.uuid, "VM created");
                Ok(spec)
            }
            Err(e) => {
                warn!(name = %spec.name, error = %e, "VM define failed");

                if let Ok(DomainStatus::Running | DomainStatus::Stopped) =
                    self.hypervisor.status(&spec.name).await
                {
                    let name = spec.name.clone();
                    match domains.put(spec, true) {
                        Ok(_) => info!(name = %name, "Recorded VM left defined by failed create"),
                        Err(store_err) => {
                            warn!(name = %name, error = %store_err, "Failed to record VM")
                        }
                    }
                }
                Err(e.into())
            }
        }
    }

    /// All declared VMs, ordered by name.
    pub async fn list_vms(&self) -> Vec<VmSpec> {
        self.domains.list().await
    }

    pub async fn start_vm(&self, name: &str) -> Result<VmSpec, NodeError> {
        self.set_power(name, PowerState::Running).await
    }

    pub async fn stop_vm(&self, name: &str) -> Result<VmSpec, NodeError> {
        self.set_power(name, PowerState::Stopped).await
    }

    async fn set_power(&self, name: &str, state: PowerState) -> Result<VmSpec, NodeError> {
        let mut domains = self.domains.write().await;
        let spec = domains.set_desired_state(name, state)?;

        match state {
            PowerState::Running => self.hypervisor.start(name).await?,
            PowerState::Stopped => self.hypervisor.stop(name).await?,
        }

        info!(name, state = %state, "VM power state applied");
        Ok(spec)
    }

    pub async fn vm_status(&self, name: &str) -> Result<VmStatus, NodeError> {
        let spec = self
            .domains
            .get(name)
            .await
            .ok_or_else(|| NodeError::NotFound(format!("vm {name}")))?;

        let state = self.hypervisor.status(name).await?;
        Ok(VmStatus {
            name: spec.name,
            state,
            desired: spec.desired_power_state,
        })
    }

    /// Destroy a VM and forget it.
    pub async fn delete_vm(&self, name: &str, delete_files: bool) -> Result<VmSpec, NodeError> {
        let mut domains = self.domains.write().await;
        if !domains.contains(name) {
            return Err(NodeError::NotFound(format!("vm {name}")));
        }

        self.hypervisor.destroy(name, delete_files).await?;
        let removed = domains.remove(name)?;

        info!(name, delete_files, "VM deleted");
        Ok(removed)
    }

    /// Wait for a VM's DHCP lease.
    ///
    /// `network` defaults to the VM's own network and `timeout_secs` to the
    /// configured lease wait.
    pub async fn vm_ip(
        &self,
        name: &str,
        network: Option<&str>,
        timeout_secs: Option<i64>,
    ) -> Result<std::net::Ipv4Addr, NodeError> {
        let timeout = ip_timeout(timeout_secs, self.config.ip_timeout)?;
        let network = network.map(|n| validate_label("network", n)).transpose()?;

        // Read guard is released here, before the wait.
        let spec = self
            .domains
            .get(name)
            .await
            .ok_or_else(|| NodeError::NotFound(format!("vm {name}")))?;
        let network = network.unwrap_or(spec.network_name);

        debug!(name, network = %network, timeout_secs = timeout.as_secs(), "Waiting for lease");

        let lookup = self.hypervisor.lease_ip(name, &network, timeout);
        match tokio::time::timeout(timeout + LEASE_GRACE, lookup).await {
            Ok(result) => {
                let ip = result?;
                info!(name, ip = %ip, "VM lease found");
                Ok(ip)
            }
            Err(_) => Err(NodeError::Timeout {
                what: format!("DHCP lease for vm {name} on {network}"),
                after: timeout,
            }),
        }
    }

    // ---- Port rules ----

    /// Declare a port forward and install it.
    ///
    /// Replaces any rule on the same listen port.
    pub async fn create_port_rule(
        &self,
        request: CreatePortRuleRequest,
    ) -> Result<PortRule, NodeError> {
        let rule = request.validate()?;

        let mut rules = self.rules.write().await;
        let rule = rules.put(rule)?;

        if let Err(e) = self.firewall.install(&rule).await {
            warn!(
                listen_port = rule.listen_port,
                error = %e,
                "Port rule declared but not installed"
            );
            return Err(e.into());
        }

        info!(
            listen_port = rule.listen_port,
            target_ip = %rule.target_ip,
            target_port = rule.target_port,
            "Port rule applied"
        );
        Ok(rule)
    }

    /// All declared port rules, ordered by listen port.
    pub async fn list_port_rules(&self) -> Vec<PortRule> {
        self.rules.list().await
    }

    /// Uninstall a port forward and forget it.
    pub async fn delete_port_rule(&self, listen_port: u16) -> Result<PortRule, NodeError> {
        let mut rules = self.rules.write().await;
        if rules.get(listen_port).is_none() {
            return Err(NodeError::NotFound(format!("port rule {listen_port}")));
        }

        self.firewall.remove(listen_port).await?;
        let removed = rules.remove(listen_port)?;

        info!(listen_port, "Port rule deleted");
        Ok(removed)
    }

    // ---- Restore ----

    /// Reinstall every declared port rule.
    ///
    /// Never fails: each rule is attempted and failures are reported.
    pub async fn restore_port_rules(&self) -> RestoreSummary {
        let rules = self.rules.write().await;
        let declared = rules.list();

        let missing_before = match self.firewall.list_installed().await {
            Ok(installed) => {
                let diff = KeyDiff::compute(
                    declared.iter().map(|r| &r.listen_port),
                    installed.iter(),
                );
                if !diff.unmanaged.is_empty() {
                    warn!(ports = ?diff.unmanaged, "Installed forwards with no declared rule");
                }
                debug!(
                    missing = diff.missing.len(),
                    present = diff.present.len(),
                    "Port rules before restore"
                );
                Some(diff.missing.len())
            }
            Err(e) => {
                warn!(error = %e, "Could not list installed forwards, reinstalling all");
                None
            }
        };

        let mut report = BatchReport::new();
        for rule in &declared {
            let result = self.firewall.install(rule).await;
            if let Err(e) = &result {
                warn!(listen_port = rule.listen_port, error = %e, "Failed to restore port rule");
            }
            report.record(rule.listen_port, result);
        }
        drop(rules);

        info!(
            restored = report.success_count(),
            failed = report.failure_count(),
            "Port rules restored"
        );
        RestoreSummary::new(report, missing_before)
    }

    /// Drive every declared domain towards its desired power state.
    ///
    /// Domains the hypervisor does not know are reported as diverged; they
    /// are never redefined here.
    pub async fn reconcile_domains(&self) -> DomainSummary {
        let domains = self.domains.write().await;

        let mut outcomes = Vec::with_capacity(domains.len());
        let mut actions = BatchReport::new();

        for spec in domains.list() {
            let desired = spec.desired_power_state;
            let observed = match self.hypervisor.status(&spec.name).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(name = %spec.name, error = %e, "Could not query domain");
                    actions.record(spec.name.clone(), Err::<(), _>(e));
                    outcomes.push(DomainOutcome {
                        name: spec.name,
                        desired,
                        observed: DomainStatus::Unknown,
                        status: ConvergenceStatus::Diverged,
                    });
                    continue;
                }
            };

            let status = match (desired, observed) {
                (_, DomainStatus::Unknown) => {
                    warn!(name = %spec.name, "Declared domain is not defined on the hypervisor");
                    actions.record(
                        spec.name.clone(),
                        Err::<(), _>("domain is not defined on the hypervisor"),
                    );
                    ConvergenceStatus::Diverged
                }
                (PowerState::Running, DomainStatus::Running)
                | (PowerState::Stopped, DomainStatus::Stopped) => ConvergenceStatus::Converged,
                (PowerState::Running, DomainStatus::Stopped) => {
                    let result = self.hypervisor.start(&spec.name).await;
                    self.repair(&mut actions, &spec.name, desired, result)
                }
                (PowerState::Stopped, DomainStatus::Running) => {
                    let result = self.hypervisor.stop(&spec.name).await;
                    self.repair(&mut actions, &spec.name, desired, result)
                }
            };

            outcomes.push(DomainOutcome {
                name: spec.name,
                desired,
                observed,
                status,
            });
        }
        drop(domains);

        let summary = DomainSummary::new(outcomes, actions);
        info!(
            converged = summary.count(ConvergenceStatus::Converged),
            repaired = summary.count(ConvergenceStatus::Repaired),
            diverged = summary.count(ConvergenceStatus::Diverged),
            "Domains reconciled"
        );
        summary
    }

    fn repair<E: std::fmt::Display>(
        &self,
        actions: &mut BatchReport<String>,
        name: &str,
        desired: PowerState,
        result: Result<(), E>,
    ) -> ConvergenceStatus {
        if let Err(e) = &result {
            warn!(name, desired = %desired, error = %e, "Failed to repair domain power state");
        }
        if actions.record(name.to_string(), result) {
            info!(name, desired = %desired, "Domain power state repaired");
            ConvergenceStatus::Repaired
        } else {
            ConvergenceStatus::Diverged
        }
    }

    /// Boot pass: port rules always, domain power state when enabled.
    pub async fn restore(&self) -> BootReport {
        let rules = self.restore_port_rules().await;
        let domains = if self.config.restore_domains {
            Some(self.reconcile_domains().await)
        } else {
            None
        };
        BootReport { rules, domains }
    }
}
