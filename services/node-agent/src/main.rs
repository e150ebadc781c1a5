//! vmnode Node Agent
//!
//! Boot sequence:
//! 1. Load configuration and initialize logging
//! 2. Open the rule store and domain registry
//! 3. Wait for the overlay interface
//! 4. Restore declared port rules (and domain power state if enabled)
//! 5. Serve the HTTP control surface until Ctrl+C

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmnode_agent::api::{self, AppState};
use vmnode_agent::config::{Backend, Config};
use vmnode_agent::firewall::{Firewall, IptablesConfig, IptablesFirewall, MockFirewall};
use vmnode_agent::hypervisor::{Hypervisor, MockHypervisor, VirshConfig, VirshHypervisor};
use vmnode_agent::network;
use vmnode_agent::reconciler::{Reconciler, ReconcilerConfig};
use vmnode_agent::state::{DomainRegistry, RuleStore};

fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        work_dir = %config.work_dir.display(),
        backend = ?config.backend,
        worker_threads = config.worker_threads,
        "Starting vmnode node agent"
    );

    let rules = Arc::new(
        RuleStore::open(config.rules_path()).context("failed to open port rule store")?,
    );
    let domains = Arc::new(
        DomainRegistry::open(config.domains_path()).context("failed to open domain registry")?,
    );

    let (hypervisor, firewall): (Arc<dyn Hypervisor>, Arc<dyn Firewall>) = match config.backend {
        Backend::Host => (
            Arc::new(VirshHypervisor::new(VirshConfig::from_config(&config))),
            Arc::new(IptablesFirewall::new(IptablesConfig::from_config(&config))),
        ),
        Backend::Mock => {
            warn!("Using in-memory backends, nothing is applied to the host");
            (Arc::new(MockHypervisor::new()), Arc::new(MockFirewall::new()))
        }
    };

    if config.backend == Backend::Host {
        info!(iface = %config.overlay_iface, "Waiting for overlay interface");
        if let Err(e) = network::wait_for_interface(&config.overlay_iface, config.overlay_wait).await {
            warn!(error = %e, "Overlay interface not up, restoring anyway");
        }
    }

    let reconciler = Arc::new(Reconciler::new(
        rules,
        domains,
        hypervisor,
        firewall,
        ReconcilerConfig::from_config(&config),
    ));

    // Restore before accepting requests so callers never race the pass.
    let report = reconciler.restore().await;
    info!(
        restored = report.rules.restored_count,
        failed = report.rules.failed.len(),
        domains_reconciled = report.domains.is_some(),
        "Restore pass complete"
    );

    let app = api::create_router(AppState::new(reconciler));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
        .context("HTTP server failed")?;

    info!("Node agent shutdown complete");
    Ok(())
}
