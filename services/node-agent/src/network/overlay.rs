//! Overlay interface readiness.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::NetworkError;

const SYSFS_NET: &str = "/sys/class/net";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether a network interface exists on the host.
pub async fn interface_exists(iface: &str) -> bool {
    interface_exists_in(Path::new(SYSFS_NET), iface).await
}

async fn interface_exists_in(root: &Path, iface: &str) -> bool {
    tokio::fs::try_exists(root.join(iface)).await.unwrap_or(false)
}

/// Wait until `iface` exists, polling once a second.
pub async fn wait_for_interface(iface: &str, timeout: Duration) -> Result<(), NetworkError> {
    wait_in(Path::new(SYSFS_NET), iface, timeout, POLL_INTERVAL).await
}

async fn wait_in(
    root: &Path,
    iface: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), NetworkError> {
    let started = Instant::now();

    loop {
        if interface_exists_in(root, iface).await {
            info!(iface, waited_ms = started.elapsed().as_millis() as u64, "Interface is up");
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(NetworkError::InterfaceTimeout {
                iface: iface.to_string(),
                after: timeout,
            });
        }
        debug!(iface, "Waiting for interface");
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_existing_interface() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("wg0")).unwrap();

        wait_in(root.path(), "wg0", Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let root = tempfile::tempdir().unwrap();

        let err = wait_in(root.path(), "wg0", Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::InterfaceTimeout { .. }));
    }

    #[tokio::test]
    async fn test_interface_appears_late() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("wg0");

        let creator = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            std::fs::create_dir(path).unwrap();
        });

        wait_in(root.path(), "wg0", Duration::from_secs(2), Duration::from_millis(10))
            .await
            .unwrap();
        creator.await.unwrap();
    }
}
