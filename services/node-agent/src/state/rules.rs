//! Port rule store.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::{StateFile, StoreError};

/// Rule store file format version.
const RULES_VERSION: u32 = 1;

/// Transport protocol of a forward. Only TCP is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared port forward: `node:listen_port -> target_ip:target_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub listen_port: u16,
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub proto: Protocol,
    pub created_at: DateTime<Utc>,
}

impl PortRule {
    pub fn new(listen_port: u16, target_ip: Ipv4Addr, target_port: u16) -> Self {
        Self {
            listen_port,
            target_ip,
            target_port,
            proto: Protocol::Tcp,
            created_at: Utc::now(),
        }
    }

    /// True if both rules forward to the same endpoint.
    pub fn same_target(&self, other: &PortRule) -> bool {
        self.target_ip == other.target_ip
            && self.target_port == other.target_port
            && self.proto == other.proto
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRules {
    version: u32,
    rules: BTreeMap<u16, PortRule>,
}

/// The rule map plus its backing file. Reached through [`RuleStore`] guards.
#[derive(Debug)]
pub struct RuleTable {
    file: StateFile,
    rules: BTreeMap<u16, PortRule>,
}

impl RuleTable {
    /// Insert or replace the rule for its listen port.
    ///
    /// Replacing a rule with an identical target keeps the original
    /// `created_at`.
    pub fn put(&mut self, mut rule: PortRule) -> Result<PortRule, StoreError> {
        if let Some(existing) = self.rules.get(&rule.listen_port) {
            if existing.same_target(&rule) {
                rule.created_at = existing.created_at;
            }
        }

        let mut next = self.rules.clone();
        next.insert(rule.listen_port, rule.clone());
        self.commit(next)?;

        debug!(listen_port = rule.listen_port, "Rule declared");
        Ok(rule)
    }

    /// Delete the rule for a listen port.
    pub fn remove(&mut self, listen_port: u16) -> Result<PortRule, StoreError> {
        let mut next = self.rules.clone();
        let removed = next
            .remove(&listen_port)
            .ok_or_else(|| StoreError::NotFound(format!("port rule {listen_port}")))?;
        self.commit(next)?;

        debug!(listen_port, "Rule removed");
        Ok(removed)
    }

    pub fn get(&self, listen_port: u16) -> Option<&PortRule> {
        self.rules.get(&listen_port)
    }

    /// All rules, ordered by listen port.
    pub fn list(&self) -> Vec<PortRule> {
        self.rules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Persist `next`, then make it the visible state.
    fn commit(&mut self, next: BTreeMap<u16, PortRule>) -> Result<(), StoreError> {
        let persisted = PersistedRules {
            version: RULES_VERSION,
            rules: next,
        };
        self.file.save(&persisted)?;
        self.rules = persisted.rules;
        Ok(())
    }
}

/// Durable, ordered record of declared port rules.
///
/// Mutations take the write guard and hold it for the whole
/// persist-then-apply sequence; reads share the lock.
#[derive(Debug)]
pub struct RuleStore {
    table: RwLock<RuleTable>,
}

impl RuleStore {
    /// Open or create a rule store at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = StateFile::disk(path);
        let rules = match file.load::<PersistedRules>()? {
            Some(persisted) if persisted.version == RULES_VERSION => persisted.rules,
            Some(persisted) => {
                return Err(StoreError::UnsupportedVersion {
                    path: file.path().map(|p| p.to_path_buf()).unwrap_or_default(),
                    found: persisted.version,
                    expected: RULES_VERSION,
                })
            }
            None => BTreeMap::new(),
        };

        info!(rule_count = rules.len(), "Rule store opened");

        Ok(Self {
            table: RwLock::new(RuleTable { file, rules }),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Self {
        Self {
            table: RwLock::new(RuleTable {
                file: StateFile::Memory,
                rules: BTreeMap::new(),
            }),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, RuleTable> {
        self.table.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, RuleTable> {
        self.table.write().await
    }

    /// Snapshot of all rules, ordered by listen port.
    pub async fn list(&self) -> Vec<PortRule> {
        self.read().await.list()
    }
}
