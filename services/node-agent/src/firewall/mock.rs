//! In-memory packet filter for testing and development.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::state::PortRule;

use super::{Firewall, FirewallError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Tables {
    /// Installed forwards per listen port. A list so duplicate installs
    /// would be visible.
    ports: BTreeMap<u16, Vec<(Ipv4Addr, u16)>>,
    shared: bool,
}

/// Mock packet filter.
///
/// Records installed forwards per listen port. `clear` simulates the kernel
/// tables being wiped by a reboot.
#[derive(Default)]
pub struct MockFirewall {
    tables: Mutex<Tables>,
    installs: AtomicU64,
    fail_all: AtomicBool,
    fail_ports: Mutex<HashSet<u16>>,
    listing_unavailable: AtomicBool,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock packet filter that fails all operations.
    pub fn failing() -> Self {
        let fw = Self::new();
        fw.set_failing(true);
        fw
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Make installs of one listen port fail.
    pub fn fail_port(&self, listen_port: u16) {
        lock(&self.fail_ports).insert(listen_port);
    }

    /// Make `list_installed` fail while installs keep working.
    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.listing_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every installed entry.
    pub fn clear(&self) {
        let mut tables = lock(&self.tables);
        tables.ports.clear();
        tables.shared = false;
    }

    /// Number of forwarding entries installed for a port.
    pub fn entry_count(&self, listen_port: u16) -> usize {
        lock(&self.tables)
            .ports
            .get(&listen_port)
            .map_or(0, Vec::len)
    }

    /// Target a port currently forwards to.
    pub fn installed_target(&self, listen_port: u16) -> Option<(Ipv4Addr, u16)> {
        lock(&self.tables)
            .ports
            .get(&listen_port)
            .and_then(|entries| entries.last().copied())
    }

    /// Whether the shared NAT entries are installed.
    pub fn has_shared(&self) -> bool {
        lock(&self.tables).shared
    }

    /// Number of successful installs so far.
    pub fn install_count(&self) -> u64 {
        self.installs.load(Ordering::SeqCst)
    }

    fn check_failing(&self, op: &str) -> Result<(), FirewallError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(FirewallError::Other(format!(
                "mock firewall configured to fail {op}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for MockFirewall {
    async fn install(&self, rule: &PortRule) -> Result<(), FirewallError> {
        self.check_failing("install")?;
        if lock(&self.fail_ports).contains(&rule.listen_port) {
            return Err(FirewallError::Other(format!(
                "mock firewall refused port {}",
                rule.listen_port
            )));
        }

        let mut tables = lock(&self.tables);
        tables.shared = true;
        tables
            .ports
            .insert(rule.listen_port, vec![(rule.target_ip, rule.target_port)]);
        drop(tables);

        self.installs.fetch_add(1, Ordering::SeqCst);
        info!(
            listen_port = rule.listen_port,
            target = %format!("{}:{}", rule.target_ip, rule.target_port),
            "[MOCK] Installed port forward"
        );
        Ok(())
    }

    async fn remove(&self, listen_port: u16) -> Result<(), FirewallError> {
        self.check_failing("remove")?;

        let mut tables = lock(&self.tables);
        if tables.ports.remove(&listen_port).is_some() {
            debug!(listen_port, "[MOCK] Removed port forward");
        }
        if tables.ports.is_empty() {
            tables.shared = false;
        }
        Ok(())
    }

    async fn list_installed(&self) -> Result<BTreeSet<u16>, FirewallError> {
        self.check_failing("list")?;
        if self.listing_unavailable.load(Ordering::SeqCst) {
            return Err(FirewallError::Listing("mock listing unavailable".to_string()));
        }
        Ok(lock(&self.tables).ports.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(listen_port: u16, last_octet: u8) -> PortRule {
        PortRule::new(listen_port, Ipv4Addr::new(192, 168, 122, last_octet), 22)
    }

    #[tokio::test]
    async fn test_install_replaces_port_entries() {
        let fw = MockFirewall::new();
        fw.install(&rule(8080, 10)).await.unwrap();
        fw.install(&rule(8080, 10)).await.unwrap();
        fw.install(&rule(8080, 11)).await.unwrap();

        assert_eq!(fw.entry_count(8080), 1);
        assert_eq!(
            fw.installed_target(8080),
            Some((Ipv4Addr::new(192, 168, 122, 11), 22))
        );
        assert_eq!(fw.install_count(), 3);
    }

    #[tokio::test]
    async fn test_remove_last_port_drops_shared() {
        let fw = MockFirewall::new();
        fw.install(&rule(8080, 10)).await.unwrap();
        fw.install(&rule(8081, 10)).await.unwrap();

        fw.remove(8080).await.unwrap();
        assert!(fw.has_shared());

        fw.remove(8081).await.unwrap();
        fw.remove(8081).await.unwrap();
        assert!(!fw.has_shared());
        assert!(fw.list_installed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_port() {
        let fw = MockFirewall::new();
        fw.fail_port(9000);
        assert!(fw.install(&rule(9000, 10)).await.is_err());
        assert!(fw.install(&rule(9001, 10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_simulates_reboot() {
        let fw = MockFirewall::new();
        fw.install(&rule(8080, 10)).await.unwrap();
        fw.clear();
        assert_eq!(fw.entry_count(8080), 0);
        assert!(!fw.has_shared());
    }
}
