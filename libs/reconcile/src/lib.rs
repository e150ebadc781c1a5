//! Reconciliation primitives.
//!
//! Helpers shared by the node agent for converging actual host state to the
//! declared state held in its stores. Key concepts:
//!
//! - **Declared state**: what the node has promised to keep (rules, domains).
//! - **Actual state**: what the host currently reports (firewall, hypervisor).
//! - **Convergence**: making actual match declared, one key at a time.
//!
//! # Invariants
//!
//! - A batch never aborts on the first failure; every item is attempted.
//! - Every failure stays observable: it is recorded with its key and cause.
//! - Diffs are deterministic given the same inputs (ordered sets).

use std::collections::BTreeSet;
use std::fmt::Display;

use serde::Serialize;

/// Convergence status for a single declared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Actual state matches the declaration.
    Converged,

    /// A corrective action was taken during this pass.
    Repaired,

    /// Actual state differs and could not be corrected.
    Diverged,
}

impl ConvergenceStatus {
    /// Returns true if the key ended the pass matching its declaration.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged | Self::Repaired)
    }
}

/// Difference between a declared key set and the set reported installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDiff<K: Ord> {
    /// Declared but not installed.
    pub missing: BTreeSet<K>,

    /// Declared and installed.
    pub present: BTreeSet<K>,

    /// Installed but never declared (left alone; reported only).
    pub unmanaged: BTreeSet<K>,
}

impl<K: Ord + Clone> KeyDiff<K> {
    /// Compute the diff between declared and installed keys.
    pub fn compute<'a, D, I>(declared: D, installed: I) -> Self
    where
        K: 'a,
        D: IntoIterator<Item = &'a K>,
        I: IntoIterator<Item = &'a K>,
    {
        let declared: BTreeSet<K> = declared.into_iter().cloned().collect();
        let installed: BTreeSet<K> = installed.into_iter().cloned().collect();

        Self {
            missing: declared.difference(&installed).cloned().collect(),
            present: declared.intersection(&installed).cloned().collect(),
            unmanaged: installed.difference(&declared).cloned().collect(),
        }
    }

    /// Returns true if nothing declared is missing.
    pub fn is_converged(&self) -> bool {
        self.missing.is_empty()
    }
}

/// A single failed item in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure<K> {
    pub key: K,
    pub error: String,
}

/// Outcome of a best-effort batch.
///
/// Items are recorded one at a time; the batch itself cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport<K> {
    succeeded: Vec<K>,
    failed: Vec<ItemFailure<K>>,
}

impl<K> Default for BatchReport<K> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K> BatchReport<K> {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of one item.
    ///
    /// Returns true if the item succeeded.
    pub fn record<T, E: Display>(&mut self, key: K, result: Result<T, E>) -> bool {
        match result {
            Ok(_) => {
                self.succeeded.push(key);
                true
            }
            Err(e) => {
                self.failed.push(ItemFailure {
                    key,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Keys that succeeded, in the order they were attempted.
    pub fn succeeded(&self) -> &[K] {
        &self.succeeded
    }

    /// Items that failed, in the order they were attempted.
    pub fn failed(&self) -> &[ItemFailure<K>] {
        &self.failed
    }

    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    /// Total number of items attempted.
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Returns true if every attempted item succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
