//! Connection bookkeeping, liveness and batching settings.

use serde::{Deserialize, Serialize};

/// What to do when a principal opens a connection past its cap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionLimitPolicy {
    /// Close the principal's oldest connection to make room.
    #[default]
    EvictOldest,
    /// Refuse the new connection.
    Reject,
}

/// Real-time hub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Maximum live connections per principal, across all scopes.
    pub max_connections_per_user: usize,
    /// Policy applied when `max_connections_per_user` is reached.
    pub connection_limit_policy: ConnectionLimitPolicy,
    /// Heartbeat monitor period; also the idle age that triggers a heartbeat.
    #[serde(rename = "heartbeatIntervalSeconds")]
    pub heartbeat_interval_secs: u64,
    /// Stale reaper period.
    #[serde(rename = "cleanupIntervalSeconds")]
    pub cleanup_interval_secs: u64,
    /// Heartbeat age past which the reaper drops a connection.
    #[serde(rename = "staleThresholdSeconds")]
    pub stale_threshold_secs: u64,
    /// Intake queue capacity.
    pub queue_max_size: usize,
    /// Maximum messages drained into one batch.
    pub max_batch_size: usize,
    /// How long the batch consumer waits for a message before looping.
    pub batch_poll_interval_ms: u64,
    /// How long one heartbeat may wait to reach the socket.
    pub heartbeat_timeout_ms: u64,
    /// Per-connection outbound buffer (frames).
    pub outbound_buffer_size: usize,
    /// Pause after a maintenance loop error before the next iteration.
    pub error_backoff_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            max_connections_per_user: 10,
            connection_limit_policy: ConnectionLimitPolicy::EvictOldest,
            heartbeat_interval_secs: 30,
            cleanup_interval_secs: 60,
            stale_threshold_secs: 300,
            queue_max_size: 1000,
            max_batch_size: 50,
            batch_poll_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
            outbound_buffer_size: 256,
            error_backoff_ms: 1000,
        }
    }
}

/// Cross-process fan-out settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Redis URL. When unset the hub runs single-process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Pub/sub channel shared by all hub processes.
    pub channel: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel: "herald:broadcast".to_string(),
        }
    }
}
