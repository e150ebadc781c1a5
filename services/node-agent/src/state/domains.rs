//! Domain registry.
//!
//! The registry is the source of truth for "this node owns this domain".

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::{StateFile, StoreError};

/// Domain registry file format version.
const DOMAINS_VERSION: u32 = 1;

/// Power state a domain should be kept in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// A declared virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub disk_size_gb: u32,
    pub network_name: String,
    pub os_arch: String,
    pub desired_power_state: PowerState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDomains {
    version: u32,
    domains: BTreeMap<String, VmSpec>,
}

/// The spec map plus its backing file. Reached through [`DomainRegistry`] guards.
#[derive(Debug)]
pub struct DomainTable {
    file: StateFile,
    domains: BTreeMap<String, VmSpec>,
}

impl DomainTable {
    /// Record a spec.
    ///
    /// Fails with `Conflict` if the name is taken and `replace` is false.
    pub fn put(&mut self, spec: VmSpec, replace: bool) -> Result<VmSpec, StoreError> {
        if !replace && self.domains.contains_key(&spec.name) {
            return Err(StoreError::Conflict(format!("vm {}", spec.name)));
        }

        let mut next = self.domains.clone();
        next.insert(spec.name.clone(), spec.clone());
        self.commit(next)?;

        debug!(name = %spec.name, replace, "Domain declared");
        Ok(spec)
    }

    /// Update the desired power state of a declared domain.
    pub fn set_desired_state(
        &mut self,
        name: &str,
        state: PowerState,
    ) -> Result<VmSpec, StoreError> {
        let mut next = self.domains.clone();
        let spec = next
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("vm {name}")))?;

        if spec.desired_power_state == state {
            return Ok(spec.clone());
        }

        spec.desired_power_state = state;
        let updated = spec.clone();
        self.commit(next)?;

        debug!(name, state = %state, "Desired power state updated");
        Ok(updated)
    }

    /// Delete a declared domain.
    pub fn remove(&mut self, name: &str) -> Result<VmSpec, StoreError> {
        let mut next = self.domains.clone();
        let removed = next
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(format!("vm {name}")))?;
        self.commit(next)?;

        debug!(name, "Domain removed");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<&VmSpec> {
        self.domains.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.domains.contains_key(name)
    }

    /// All specs, ordered by name.
    pub fn list(&self) -> Vec<VmSpec> {
        self.domains.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    fn commit(&mut self, next: BTreeMap<String, VmSpec>) -> Result<(), StoreError> {
        let persisted = PersistedDomains {
            version: DOMAINS_VERSION,
            domains: next,
        };
        self.file.save(&persisted)?;
        self.domains = persisted.domains;
        Ok(())
    }
}

/// Durable record of declared VM specs and their desired power state.
#[derive(Debug)]
pub struct DomainRegistry {
    table: RwLock<DomainTable>,
}

impl DomainRegistry {
    /// Open or create a registry at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = StateFile::disk(path);
        let domains = match file.load::<PersistedDomains>()? {
            Some(persisted) if persisted.version == DOMAINS_VERSION => persisted.domains,
            Some(persisted) => {
                return Err(StoreError::UnsupportedVersion {
                    path: file.path().map(|p| p.to_path_buf()).unwrap_or_default(),
                    found: persisted.version,
                    expected: DOMAINS_VERSION,
                })
            }
            None => BTreeMap::new(),
        };

        info!(domain_count = domains.len(), "Domain registry opened");

        Ok(Self {
            table: RwLock::new(DomainTable { file, domains }),
        })
    }

    /// Open an in-memory registry (for testing).
    pub fn in_memory() -> Self {
        Self {
            table: RwLock::new(DomainTable {
                file: StateFile::Memory,
                domains: BTreeMap::new(),
            }),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, DomainTable> {
        self.table.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, DomainTable> {
        self.table.write().await
    }

    /// Look up a spec by name.
    pub async fn get(&self, name: &str) -> Option<VmSpec> {
        self.read().await.get(name).cloned()
    }

    /// Snapshot of all specs, ordered by name.
    pub async fn list(&self) -> Vec<VmSpec> {
        self.read().await.list()
    }
}
