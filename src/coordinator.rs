//! Coordinator & shutdown handshake (spec.md §4.H).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::segment::SegmentStore;

pub const SHUTDOWN_MARKER_NAME: &str = "collector-shutdown-complete";

/// Write the shutdown marker (mode 0644) once the collector has flushed
/// every store.
pub fn write_shutdown_marker(base: &Path) -> Result<()> {
    let path = base.join(SHUTDOWN_MARKER_NAME);
    std::fs::write(&path, b"")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

/// Poll for the shutdown marker, returning true the first time it is
/// observed. A zero timeout checks once and returns immediately.
pub async fn wait_for_collector_shutdown(base: &Path, timeout: Duration) -> bool {
    let path = base.join(SHUTDOWN_MARKER_NAME);
    if path.exists() {
        return true;
    }
    if timeout.is_zero() {
        return false;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if path.exists() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        let step = Duration::from_millis(250).min(deadline - now);
        tokio::time::sleep(step).await;
    }
}

/// Race SIGINT against SIGTERM, returning which one fired first. Shared by
/// the collector's rotation loop and the shipper's cycle loop so both
/// processes shut down on the same two signals the same way.
pub async fn wait_for_shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(AgentError::Storage)?;
    Ok(tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}

/// Run the collector's background rotation ticker until a shutdown signal
/// arrives, then flush every store and write the shutdown marker.
pub async fn run_until_shutdown(
    base_dir: PathBuf,
    cost_store: Arc<SegmentStore>,
    observability_store: Arc<SegmentStore>,
    tick: Duration,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            reason = wait_for_shutdown_signal() => {
                info!(signal = reason?, "shutting down");
                break;
            }
            _ = tokio::time::sleep(tick) => {
                if let Err(e) = cost_store.rotate_if_due() {
                    warn!(error = %e, "cost store rotation failed");
                }
                if let Err(e) = observability_store.rotate_if_due() {
                    warn!(error = %e, "observability store rotation failed");
                }
            }
        }
    }

    cost_store.flush()?;
    observability_store.flush()?;
    write_shutdown_marker(&base_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_timeout_returns_immediately_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let seen = wait_for_collector_shutdown(dir.path(), Duration::ZERO).await;
        assert!(!seen);
    }

    #[tokio::test]
    async fn marker_already_present_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        write_shutdown_marker(dir.path()).unwrap();
        let seen = wait_for_collector_shutdown(dir.path(), Duration::from_secs(1)).await;
        assert!(seen);
    }
}
