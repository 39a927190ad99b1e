//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used by the `/metrics` endpoint. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused at registration (counter, labels: reason).
pub const WS_REGISTRATION_REJECTS_TOTAL: &str = "ws_registration_rejects_total";
/// Frames accepted by connection buffers (counter).
pub const WS_FRAMES_SENT_TOTAL: &str = "ws_frames_sent_total";
/// Connections dropped by a failed broadcast send (counter).
pub const WS_BROADCAST_FAILURES_TOTAL: &str = "ws_broadcast_failures_total";
/// Messages refused at the intake queue (counter).
pub const QUEUE_REJECTIONS_TOTAL: &str = "queue_rejections_total";
/// Messages dropped at shutdown (counter).
pub const QUEUE_DROPPED_TOTAL: &str = "queue_dropped_total";
/// Frames produced by the batcher (counter).
pub const BATCH_FRAMES_TOTAL: &str = "batch_frames_total";
/// Messages per drained batch window (histogram).
pub const BATCH_SIZE: &str = "batch_size";
/// Heartbeat frames sent (counter).
pub const HEARTBEATS_SENT_TOTAL: &str = "heartbeats_sent_total";
/// Heartbeat sends that failed (counter).
pub const HEARTBEAT_FAILURES_TOTAL: &str = "heartbeat_failures_total";
/// Connections removed by the stale reaper (counter).
pub const REAPER_EVICTIONS_TOTAL: &str = "reaper_evictions_total";
/// Maintenance iterations that panicked (counter, labels: task).
pub const MAINTENANCE_PANICS_TOTAL: &str = "maintenance_panics_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            WS_REGISTRATION_REJECTS_TOTAL,
            WS_FRAMES_SENT_TOTAL,
            WS_BROADCAST_FAILURES_TOTAL,
            QUEUE_REJECTIONS_TOTAL,
            QUEUE_DROPPED_TOTAL,
            BATCH_FRAMES_TOTAL,
            BATCH_SIZE,
            HEARTBEATS_SENT_TOTAL,
            HEARTBEAT_FAILURES_TOTAL,
            REAPER_EVICTIONS_TOTAL,
            MAINTENANCE_PANICS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
