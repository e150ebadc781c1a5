//! Integration tests for the reconciliation flow.
//!
//! These tests drive the reconciler end to end against the in-memory
//! hypervisor and packet filter:
//! 1. Requests are validated, declared and applied
//! 2. Adapter failures leave declarations in place
//! 3. The restore pass converges the host back to the stores

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::rstest;
use vmnode_agent::error::NodeError;
use vmnode_agent::firewall::MockFirewall;
use vmnode_agent::hypervisor::{DomainStatus, Hypervisor, MockHypervisor};
use vmnode_agent::reconciler::{
    CreatePortRuleRequest, CreateVmRequest, Reconciler, ReconcilerConfig,
};
use vmnode_agent::state::{DomainRegistry, PowerState, RuleStore};
use vmnode_reconcile::ConvergenceStatus;

struct Harness {
    reconciler: Arc<Reconciler>,
    hypervisor: Arc<MockHypervisor>,
    firewall: Arc<MockFirewall>,
}

fn harness() -> Harness {
    harness_with(
        RuleStore::in_memory(),
        DomainRegistry::in_memory(),
        ReconcilerConfig::default(),
    )
}

fn harness_with(rules: RuleStore, domains: DomainRegistry, config: ReconcilerConfig) -> Harness {
    let hypervisor = Arc::new(MockHypervisor::new());
    let firewall = Arc::new(MockFirewall::new());
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(rules),
        Arc::new(domains),
        hypervisor.clone(),
        firewall.clone(),
        config,
    ));

    Harness {
        reconciler,
        hypervisor,
        firewall,
    }
}

fn forward(listen_port: i64, target_ip: &str, target_port: i64) -> CreatePortRuleRequest {
    CreatePortRuleRequest::tcp(listen_port, target_ip, target_port)
}

// =============================================================================
// Port rules
// =============================================================================

#[tokio::test]
async fn test_rule_install_is_idempotent() {
    let h = harness();

    h.reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap();
    h.reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap();

    assert_eq!(h.firewall.entry_count(8080), 1);
    assert_eq!(h.reconciler.list_port_rules().await.len(), 1);
}

#[tokio::test]
async fn test_rule_replaces_same_listen_port() {
    let h = harness();

    h.reconciler
        .create_port_rule(forward(8080, "10.0.0.5", 80))
        .await
        .unwrap();
    h.reconciler
        .create_port_rule(forward(8080, "10.0.0.9", 443))
        .await
        .unwrap();

    let rules = h.reconciler.list_port_rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].target_ip, Ipv4Addr::new(10, 0, 0, 9));
    assert_eq!(rules[0].target_port, 443);

    assert_eq!(h.firewall.entry_count(8080), 1);
    assert_eq!(
        h.firewall.installed_target(8080),
        Some((Ipv4Addr::new(10, 0, 0, 9), 443))
    );
}

#[tokio::test]
async fn test_rules_listed_by_listen_port() {
    let h = harness();
    for port in [9002, 9000, 9001] {
        h.reconciler
            .create_port_rule(forward(port, "192.168.122.10", 22))
            .await
            .unwrap();
    }

    let ports: Vec<u16> = h
        .reconciler
        .list_port_rules()
        .await
        .iter()
        .map(|r| r.listen_port)
        .collect();
    assert_eq!(ports, vec![9000, 9001, 9002]);
}

#[tokio::test]
async fn test_delete_rule_cleans_up() {
    let h = harness();
    h.reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap();

    let removed = h.reconciler.delete_port_rule(8080).await.unwrap();
    assert_eq!(removed.listen_port, 8080);
    assert!(h.reconciler.list_port_rules().await.is_empty());
    assert_eq!(h.firewall.entry_count(8080), 0);
    assert!(!h.firewall.has_shared());

    let err = h.reconciler.delete_port_rule(8080).await.unwrap_err();
    assert!(matches!(err, NodeError::NotFound(_)));
}

#[tokio::test]
async fn test_rule_declared_when_install_fails() {
    let h = harness();
    h.firewall.set_failing(true);

    let err = h
        .reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Firewall(_)));

    let rules = h.reconciler.list_port_rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(h.firewall.entry_count(8080), 0);

    // Retrying the same call converges once the filter recovers.
    h.firewall.set_failing(false);
    h.reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap();
    assert_eq!(h.firewall.entry_count(8080), 1);
}

#[tokio::test]
async fn test_rule_kept_when_remove_fails() {
    let h = harness();
    h.reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap();

    h.firewall.set_failing(true);
    let err = h.reconciler.delete_port_rule(8080).await.unwrap_err();
    assert!(matches!(err, NodeError::Firewall(_)));
    assert_eq!(h.reconciler.list_port_rules().await.len(), 1);

    h.firewall.set_failing(false);
    h.reconciler.delete_port_rule(8080).await.unwrap();
    assert!(h.reconciler.list_port_rules().await.is_empty());
}

#[rstest]
#[case::port_zero(forward(0, "192.168.122.10", 22))]
#[case::port_too_large(forward(70000, "192.168.122.10", 22))]
#[case::target_port_zero(forward(8080, "192.168.122.10", 0))]
#[case::not_an_ip(forward(8080, "vm1.local", 22))]
#[case::ipv6(forward(8080, "fd00::1", 22))]
#[case::udp(CreatePortRuleRequest { proto: "udp".to_string(), ..forward(8080, "192.168.122.10", 22) })]
#[tokio::test]
async fn test_invalid_rule_has_no_side_effects(#[case] request: CreatePortRuleRequest) {
    let h = harness();

    let err = h.reconciler.create_port_rule(request).await.unwrap_err();
    assert!(matches!(err, NodeError::Validation(_)), "{err}");

    assert!(h.reconciler.list_port_rules().await.is_empty());
    assert_eq!(h.firewall.install_count(), 0);
}

#[tokio::test]
async fn test_concurrent_rule_creation() {
    let h = harness();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let reconciler = Arc::clone(&h.reconciler);
            tokio::spawn(async move {
                reconciler
                    .create_port_rule(forward(10_000 + i, "192.168.122.10", 22))
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.reconciler.list_port_rules().await.len(), 16);
    assert_eq!(h.firewall.install_count(), 16);
}

// =============================================================================
// Restore
// =============================================================================

#[tokio::test]
async fn test_restore_converges_and_is_repeatable() {
    let h = harness();
    for port in [8080, 8081, 8082] {
        h.reconciler
            .create_port_rule(forward(port, "192.168.122.10", 22))
            .await
            .unwrap();
    }

    // Reboot wipes the kernel tables.
    h.firewall.clear();

    let summary = h.reconciler.restore_port_rules().await;
    assert_eq!(summary.restored_count, 3);
    assert_eq!(summary.missing_before, Some(3));
    assert!(summary.failed.is_empty());
    for port in [8080, 8081, 8082] {
        assert_eq!(h.firewall.entry_count(port), 1);
    }

    let again = h.reconciler.restore_port_rules().await;
    assert_eq!(again.restored_count, 3);
    assert_eq!(again.missing_before, Some(0));
    for port in [8080, 8081, 8082] {
        assert_eq!(h.firewall.entry_count(port), 1);
    }
}

#[tokio::test]
async fn test_restore_continues_past_failures() {
    let h = harness();
    for port in [8080, 8081, 8082] {
        h.reconciler
            .create_port_rule(forward(port, "192.168.122.10", 22))
            .await
            .unwrap();
    }
    h.firewall.clear();
    h.firewall.fail_port(8081);

    let summary = h.reconciler.restore_port_rules().await;
    assert_eq!(summary.restored_count, 2);
    assert_eq!(summary.failed_ports(), vec![8081]);
    assert_eq!(h.firewall.entry_count(8080), 1);
    assert_eq!(h.firewall.entry_count(8082), 1);

    // The failed rule is still declared.
    assert_eq!(h.reconciler.list_port_rules().await.len(), 3);
}

#[tokio::test]
async fn test_restore_without_listing() {
    let h = harness();
    h.reconciler
        .create_port_rule(forward(8080, "192.168.122.10", 22))
        .await
        .unwrap();
    h.firewall.clear();
    h.firewall.set_listing_unavailable(true);

    let summary = h.reconciler.restore_port_rules().await;
    assert_eq!(summary.restored_count, 1);
    assert_eq!(summary.missing_before, None);
    assert_eq!(h.firewall.entry_count(8080), 1);
}

#[tokio::test]
async fn test_restore_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("portmap.json");
    let domains_path = dir.path().join("domains.json");

    {
        let h = harness_with(
            RuleStore::open(&rules_path).unwrap(),
            DomainRegistry::open(&domains_path).unwrap(),
            ReconcilerConfig::default(),
        );
        h.reconciler
            .create_port_rule(forward(8080, "192.168.122.10", 22))
            .await
            .unwrap();
        h.reconciler
            .create_port_rule(forward(2222, "192.168.122.11", 22))
            .await
            .unwrap();
        h.reconciler
            .create_vm(CreateVmRequest::named("vm1"))
            .await
            .unwrap();
    }

    // Fresh process: new adapters with nothing installed.
    let h = harness_with(
        RuleStore::open(&rules_path).unwrap(),
        DomainRegistry::open(&domains_path).unwrap(),
        ReconcilerConfig::default(),
    );

    let report = h.reconciler.restore().await;
    assert_eq!(report.rules.restored_count, 2);
    assert!(report.domains.is_none());
    assert_eq!(h.firewall.entry_count(8080), 1);
    assert_eq!(h.firewall.entry_count(2222), 1);

    let vms = h.reconciler.list_vms().await;
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].name, "vm1");
}

// =============================================================================
// VMs
// =============================================================================

#[tokio::test]
async fn test_vm_create_conflict_and_recreate() {
    let h = harness();

    let spec = h
        .reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();
    assert_eq!(spec.memory_mib, 1024);
    assert_eq!(spec.desired_power_state, PowerState::Running);
    assert_eq!(h.hypervisor.status("vm1").await.unwrap(), DomainStatus::Running);

    let err = h
        .reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Conflict(_)));
    assert_eq!(h.hypervisor.define_count(), 1);

    let recreated = h
        .reconciler
        .create_vm(CreateVmRequest {
            memory_mib: Some(2048),
            recreate: true,
            ..CreateVmRequest::named("vm1")
        })
        .await
        .unwrap();
    assert_eq!(recreated.memory_mib, 2048);
    assert_eq!(h.hypervisor.define_count(), 2);
    assert_eq!(h.hypervisor.defined_spec("vm1").unwrap().memory_mib, 2048);
    assert_eq!(h.reconciler.list_vms().await.len(), 1);
}

#[tokio::test]
async fn test_vm_not_recorded_when_define_fails() {
    let h = harness();
    h.hypervisor.set_failing(true);

    let err = h
        .reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Hypervisor(_)));
    assert!(h.reconciler.list_vms().await.is_empty());
}

#[tokio::test]
async fn test_vm_recorded_when_start_fails_after_define() {
    let h = harness();
    h.hypervisor.set_fail_starts(true);

    let err = h
        .reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Hypervisor(_)));

    // The domain exists, so the registry must track it.
    assert!(h.hypervisor.is_defined("vm1"));
    assert_eq!(h.reconciler.list_vms().await.len(), 1);

    h.hypervisor.set_fail_starts(false);
    h.reconciler.start_vm("vm1").await.unwrap();
    let status = h.reconciler.vm_status("vm1").await.unwrap();
    assert_eq!(status.state, DomainStatus::Running);
}

#[rstest]
#[case::empty_name(CreateVmRequest::named(""))]
#[case::bad_name(CreateVmRequest::named("vm 1"))]
#[case::zero_memory(CreateVmRequest { memory_mib: Some(0), ..CreateVmRequest::named("vm1") })]
#[case::negative_vcpus(CreateVmRequest { vcpus: Some(-1), ..CreateVmRequest::named("vm1") })]
#[case::bad_network(CreateVmRequest { network_name: Some("net;rm".to_string()), ..CreateVmRequest::named("vm1") })]
#[tokio::test]
async fn test_invalid_vm_has_no_side_effects(#[case] request: CreateVmRequest) {
    let h = harness();

    let err = h.reconciler.create_vm(request).await.unwrap_err();
    assert!(matches!(err, NodeError::Validation(_)), "{err}");
    assert!(h.reconciler.list_vms().await.is_empty());
    assert_eq!(h.hypervisor.define_count(), 0);
}

#[tokio::test]
async fn test_vm_power_transitions() {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();

    let spec = h.reconciler.stop_vm("vm1").await.unwrap();
    assert_eq!(spec.desired_power_state, PowerState::Stopped);
    let status = h.reconciler.vm_status("vm1").await.unwrap();
    assert_eq!(status.state, DomainStatus::Stopped);
    assert_eq!(status.desired, PowerState::Stopped);

    // Idempotent.
    h.reconciler.stop_vm("vm1").await.unwrap();

    h.reconciler.start_vm("vm1").await.unwrap();
    let status = h.reconciler.vm_status("vm1").await.unwrap();
    assert_eq!(status.state, DomainStatus::Running);
}

#[tokio::test]
async fn test_unknown_vm_is_not_found() {
    let h = harness();

    for result in [
        h.reconciler.start_vm("ghost").await.map(|_| ()),
        h.reconciler.stop_vm("ghost").await.map(|_| ()),
        h.reconciler.vm_status("ghost").await.map(|_| ()),
        h.reconciler.delete_vm("ghost", true).await.map(|_| ()),
        h.reconciler.vm_ip("ghost", None, Some(1)).await.map(|_| ()),
    ] {
        assert!(matches!(result, Err(NodeError::NotFound(_))));
    }
}

#[tokio::test]
async fn test_delete_vm() {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();
    assert!(h.hypervisor.has_files("vm1"));

    h.reconciler.delete_vm("vm1", true).await.unwrap();
    assert!(!h.hypervisor.is_defined("vm1"));
    assert!(!h.hypervisor.has_files("vm1"));
    assert!(h.reconciler.list_vms().await.is_empty());

    let err = h.reconciler.delete_vm("vm1", true).await.unwrap_err();
    assert!(matches!(err, NodeError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_vm_keeps_files() {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();

    h.reconciler.delete_vm("vm1", false).await.unwrap();
    assert!(!h.hypervisor.is_defined("vm1"));
    assert!(h.hypervisor.has_files("vm1"));
}

#[tokio::test]
async fn test_vm_ip_found() {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();
    h.hypervisor
        .grant_lease("vm1", Ipv4Addr::new(192, 168, 122, 50));

    let ip = h.reconciler.vm_ip("vm1", None, Some(5)).await.unwrap();
    assert_eq!(ip, Ipv4Addr::new(192, 168, 122, 50));
}

#[tokio::test]
async fn test_vm_ip_times_out() {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();

    let started = Instant::now();
    let err = h.reconciler.vm_ip("vm1", None, Some(1)).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, NodeError::Timeout { .. }), "{err}");
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
}

#[rstest]
#[case(0)]
#[case(3601)]
#[tokio::test]
async fn test_vm_ip_rejects_timeout_out_of_range(#[case] timeout: i64) {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();

    let err = h
        .reconciler
        .vm_ip("vm1", None, Some(timeout))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Validation(_)));
}

#[tokio::test]
async fn test_lease_wait_does_not_block_mutations() {
    let h = harness();
    h.reconciler
        .create_vm(CreateVmRequest::named("vm1"))
        .await
        .unwrap();

    let waiter = {
        let reconciler = Arc::clone(&h.reconciler);
        tokio::spawn(async move { reconciler.vm_ip("vm1", None, Some(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(
        Duration::from_millis(500),
        h.reconciler.create_vm(CreateVmRequest::named("vm2")),
    )
    .await
    .expect("create_vm blocked behind lease wait")
    .unwrap();

    waiter.abort();
}

// =============================================================================
// Domain reconciliation
// =============================================================================

#[tokio::test]
async fn test_reconcile_domains() {
    let h = harness_with(
        RuleStore::in_memory(),
        DomainRegistry::in_memory(),
        ReconcilerConfig {
            restore_domains: true,
            ..ReconcilerConfig::default()
        },
    );
    for name in ["vm1", "vm2", "vm3", "vm4"] {
        h.reconciler
            .create_vm(CreateVmRequest::named(name))
            .await
            .unwrap();
    }
    h.reconciler.stop_vm("vm2").await.unwrap();

    // Host drifts behind the agent's back.
    h.hypervisor.force_power("vm1", false);
    h.hypervisor.force_power("vm2", true);
    h.hypervisor.destroy("vm3", false).await.unwrap();

    let report = h.reconciler.restore().await;
    let domains = report.domains.unwrap();

    assert_eq!(domains.outcome("vm1").unwrap().status, ConvergenceStatus::Repaired);
    assert_eq!(domains.outcome("vm2").unwrap().status, ConvergenceStatus::Repaired);
    assert_eq!(domains.outcome("vm3").unwrap().status, ConvergenceStatus::Diverged);
    assert_eq!(domains.outcome("vm4").unwrap().status, ConvergenceStatus::Converged);
    assert_eq!(domains.failed.len(), 1);

    assert_eq!(h.hypervisor.status("vm1").await.unwrap(), DomainStatus::Running);
    assert_eq!(h.hypervisor.status("vm2").await.unwrap(), DomainStatus::Stopped);
    // Missing domains are reported, never redefined.
    assert!(!h.hypervisor.is_defined("vm3"));
}
