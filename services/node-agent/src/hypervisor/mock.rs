//! In-memory hypervisor for testing and development.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::state::VmSpec;

use super::{DomainHandle, DomainStatus, Hypervisor, HypervisorError};

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct MockDomain {
    spec: VmSpec,
    uuid: String,
    running: bool,
}

/// Mock hypervisor for testing and development.
///
/// Domains, leases and files exist only in memory. Failure toggles let tests
/// drive the error paths of the reconciler.
#[derive(Default)]
pub struct MockHypervisor {
    domains: Mutex<HashMap<String, MockDomain>>,
    leases: Mutex<HashMap<String, Ipv4Addr>>,
    files: Mutex<HashMap<String, bool>>,

    /// Counter for generating domain UUIDs.
    uuid_counter: AtomicU64,

    /// Number of domain definitions submitted.
    defines: AtomicU64,

    /// Every operation fails.
    fail_all: AtomicBool,

    /// Definitions succeed but starting fails.
    fail_starts: AtomicBool,
}

impl MockHypervisor {
    /// Create a new mock hypervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock hypervisor that fails all operations.
    pub fn failing() -> Self {
        let hv = Self::new();
        hv.set_failing(true);
        hv
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub fn set_fail_starts(&self, failing: bool) {
        self.fail_starts.store(failing, Ordering::SeqCst);
    }

    /// Hand out a DHCP lease to a domain.
    pub fn grant_lease(&self, name: &str, ip: Ipv4Addr) {
        lock(&self.leases).insert(name.to_string(), ip);
    }

    /// Spec last submitted for a domain.
    pub fn defined_spec(&self, name: &str) -> Option<VmSpec> {
        lock(&self.domains).get(name).map(|d| d.spec.clone())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        lock(&self.domains).contains_key(name)
    }

    /// Whether disk artifacts exist for a domain.
    pub fn has_files(&self, name: &str) -> bool {
        lock(&self.files).get(name).copied().unwrap_or(false)
    }

    /// Number of domain definitions submitted so far.
    pub fn define_count(&self) -> u64 {
        self.defines.load(Ordering::SeqCst)
    }

    /// Change a domain's power state behind the agent's back.
    pub fn force_power(&self, name: &str, running: bool) {
        if let Some(domain) = lock(&self.domains).get_mut(name) {
            domain.running = running;
        }
    }

    fn check_failing(&self, op: &str) -> Result<(), HypervisorError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(HypervisorError::Other(format!(
                "mock hypervisor configured to fail {op}"
            )));
        }
        Ok(())
    }

    fn next_uuid(&self) -> String {
        let counter = self.uuid_counter.fetch_add(1, Ordering::SeqCst);
        format!("00000000-0000-4000-8000-{:012x}", counter)
    }

    fn set_running(&self, name: &str, running: bool) -> Result<(), HypervisorError> {
        let mut domains = lock(&self.domains);
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        domain.running = running;
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn define_and_start(
        &self,
        spec: &VmSpec,
        recreate: bool,
    ) -> Result<DomainHandle, HypervisorError> {
        self.check_failing("define")?;

        let existing = lock(&self.domains).get(&spec.name).cloned();
        if recreate {
            self.destroy(&spec.name, true).await?;
        } else if let Some(existing) = existing {
            debug!(name = %spec.name, "[MOCK] Domain already defined");
            if !existing.running {
                self.start(&spec.name).await?;
            }
            return Ok(DomainHandle {
                name: spec.name.clone(),
                uuid: existing.uuid,
            });
        }

        info!(
            name = %spec.name,
            memory_mib = spec.memory_mib,
            vcpus = spec.vcpus,
            network = %spec.network_name,
            "[MOCK] Defining domain"
        );

        let uuid = self.next_uuid();
        lock(&self.domains).insert(
            spec.name.clone(),
            MockDomain {
                spec: spec.clone(),
                uuid: uuid.clone(),
                running: false,
            },
        );
        lock(&self.files).insert(spec.name.clone(), true);
        self.defines.fetch_add(1, Ordering::SeqCst);

        self.start(&spec.name).await?;

        Ok(DomainHandle {
            name: spec.name.clone(),
            uuid,
        })
    }

    async fn start(&self, name: &str) -> Result<(), HypervisorError> {
        self.check_failing("start")?;
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(HypervisorError::Other(format!(
                "mock hypervisor refused to start '{name}'"
            )));
        }
        debug!(name, "[MOCK] Starting domain");
        self.set_running(name, true)
    }

    async fn stop(&self, name: &str) -> Result<(), HypervisorError> {
        self.check_failing("stop")?;
        debug!(name, "[MOCK] Stopping domain");
        self.set_running(name, false)
    }

    async fn status(&self, name: &str) -> Result<DomainStatus, HypervisorError> {
        self.check_failing("status")?;
        Ok(match lock(&self.domains).get(name) {
            Some(d) if d.running => DomainStatus::Running,
            Some(_) => DomainStatus::Stopped,
            None => DomainStatus::Unknown,
        })
    }

    async fn destroy(&self, name: &str, delete_files: bool) -> Result<(), HypervisorError> {
        self.check_failing("destroy")?;
        if lock(&self.domains).remove(name).is_some() {
            info!(name, "[MOCK] Domain destroyed");
        }
        lock(&self.leases).remove(name);
        if delete_files {
            lock(&self.files).remove(name);
        }
        Ok(())
    }

    async fn lease_ip(
        &self,
        name: &str,
        network: &str,
        timeout: Duration,
    ) -> Result<Ipv4Addr, HypervisorError> {
        self.check_failing("lease lookup")?;
        if !self.is_defined(name) {
            return Err(HypervisorError::DomainNotFound(name.to_string()));
        }

        let poll = async {
            loop {
                let lease = lock(&self.leases).get(name).copied();
                if let Some(ip) = lease {
                    return ip;
                }
                tokio::time::sleep(LEASE_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| HypervisorError::Timeout {
                what: format!("DHCP lease for '{name}' on '{network}'"),
                after: timeout,
            })
    }
}
