//! Heartbeats for idle connections.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use herald_core::Envelope;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::registry::ConnectionRegistry;
use crate::maintenance::run_periodic;
use crate::metrics::{HEARTBEAT_FAILURES_TOTAL, HEARTBEATS_SENT_TOTAL};

/// Result of one heartbeat pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections that were idle long enough to get a heartbeat.
    pub sent: usize,
    /// Heartbeats that did not reach the socket in time; those connections
    /// were disconnected.
    pub failed: usize,
}

/// Sends heartbeats to connections that have been quiet for a full interval.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    heartbeat_timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            heartbeat_timeout,
        }
    }

    /// One pass: send a heartbeat to every idle connection concurrently,
    /// then disconnect the ones whose heartbeat failed.
    ///
    /// `lastHeartbeat` moves only when the session writer confirms the
    /// frame reached the socket, so a peer that stopped reading stays stale.
    pub async fn tick(&self) -> HeartbeatReport {
        let idle: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|c| c.last_heartbeat_elapsed() >= self.interval)
            .collect();
        if idle.is_empty() {
            return HeartbeatReport::default();
        }

        let frame = Arc::new(Envelope::heartbeat().stamped(Utc::now()).encode());
        let outcomes = join_all(idle.iter().map(|conn| {
            let frame = frame.clone();
            async move { conn.send_heartbeat(frame, self.heartbeat_timeout).await }
        }))
        .await;

        let mut failed = Vec::new();
        for (conn, outcome) in idle.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(conn_id = %conn.id, error = %e, "heartbeat failed");
                failed.push(conn.id.clone());
            }
        }
        for id in &failed {
            let _ = self.registry.force_disconnect(id);
        }

        let report = HeartbeatReport {
            sent: idle.len(),
            failed: failed.len(),
        };
        counter!(HEARTBEATS_SENT_TOTAL).increment(report.sent as u64);
        if report.failed > 0 {
            counter!(HEARTBEAT_FAILURES_TOTAL).increment(report.failed as u64);
        }
        debug!(sent = report.sent, failed = report.failed, "heartbeat pass");
        report
    }

    /// Run [`tick`](Self::tick) every interval until `cancel` fires.
    #[instrument(skip_all, name = "heartbeat_monitor")]
    pub async fn run(self: Arc<Self>, backoff: Duration, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat monitor started");
        let period = self.interval;
        run_periodic("heartbeat", period, backoff, cancel, move || {
            let monitor = self.clone();
            async move {
                let _ = monitor.tick().await;
            }
        })
        .await;
    }
}
