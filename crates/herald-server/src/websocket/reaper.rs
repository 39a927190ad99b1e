//! Stale connection sweep.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::registry::ConnectionRegistry;
use crate::maintenance::run_periodic;
use crate::metrics::REAPER_EVICTIONS_TOTAL;

/// Drops connections with no heartbeat for longer than a threshold.
///
/// Runs independently of the heartbeat monitor, so a connection the monitor
/// never reached is still removed.
pub struct StaleReaper {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    threshold: Duration,
}

impl StaleReaper {
    /// Create a reaper.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, threshold: Duration) -> Self {
        Self {
            registry,
            interval,
            threshold,
        }
    }

    /// Remove every stale connection. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut reaped = 0;
        for conn in self.registry.all() {
            let idle = conn.last_heartbeat_elapsed();
            if idle > self.threshold && self.registry.force_disconnect(&conn.id) {
                info!(conn_id = %conn.id, idle_secs = idle.as_secs(), "reaped stale connection");
                reaped += 1;
            }
        }
        if reaped > 0 {
            counter!(REAPER_EVICTIONS_TOTAL).increment(reaped as u64);
        }
        reaped
    }

    /// Run [`sweep`](Self::sweep) every interval until `cancel` fires.
    #[instrument(skip_all, name = "stale_reaper")]
    pub async fn run(self: Arc<Self>, backoff: Duration, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "stale reaper started"
        );
        let period = self.interval;
        run_periodic("reaper", period, backoff, cancel, move || {
            let reaper = self.clone();
            async move {
                let _ = reaper.sweep();
            }
        })
        .await;
    }
}
