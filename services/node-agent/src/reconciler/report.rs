//! Outcomes of restore passes.

use serde::Serialize;
use vmnode_reconcile::{BatchReport, ConvergenceStatus, ItemFailure};

use crate::hypervisor::DomainStatus;
use crate::state::PowerState;

/// Result of reinstalling the declared port rules.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    /// Rules installed successfully.
    pub restored_count: usize,

    /// Declared rules that had no installed entry before the pass. `None`
    /// when the packet filter could not be listed.
    pub missing_before: Option<usize>,

    /// Rules that failed to install.
    pub failed: Vec<ItemFailure<u16>>,
}

impl RestoreSummary {
    pub(crate) fn new(report: BatchReport<u16>, missing_before: Option<usize>) -> Self {
        Self {
            restored_count: report.success_count(),
            missing_before,
            failed: report.failed().to_vec(),
        }
    }

    pub fn failed_ports(&self) -> Vec<u16> {
        self.failed.iter().map(|f| f.key).collect()
    }
}

/// How one declared domain ended a reconcile pass.
#[derive(Debug, Clone, Serialize)]
pub struct DomainOutcome {
    pub name: String,
    pub desired: PowerState,
    pub observed: DomainStatus,
    pub status: ConvergenceStatus,
}

/// Result of reconciling domain power state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainSummary {
    pub outcomes: Vec<DomainOutcome>,
    pub failed: Vec<ItemFailure<String>>,
}

impl DomainSummary {
    pub(crate) fn new(outcomes: Vec<DomainOutcome>, actions: BatchReport<String>) -> Self {
        Self {
            outcomes,
            failed: actions.failed().to_vec(),
        }
    }

    pub fn count(&self, status: ConvergenceStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn outcome(&self, name: &str) -> Option<&DomainOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Result of the boot-time restore pass.
#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub rules: RestoreSummary,

    /// Present when domain reconciliation is enabled.
    pub domains: Option<DomainSummary>,
}
