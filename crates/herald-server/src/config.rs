//! Hub configuration.

use std::time::Duration;

use herald_settings::{ConnectionLimitPolicy, HeraldSettings, RealtimeSettings};

use crate::batcher::BatcherConfig;
use crate::websocket::registry::ConnectionLimits;

/// Runtime configuration of the hub, with intervals as [`Duration`]s.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Maximum live connections per principal.
    pub max_connections_per_user: usize,
    /// Policy when that cap is reached.
    pub connection_limit_policy: ConnectionLimitPolicy,
    /// Heartbeat monitor period and idle age that triggers a heartbeat.
    pub heartbeat_interval: Duration,
    /// Reaper period.
    pub cleanup_interval: Duration,
    /// Heartbeat age past which the reaper drops a connection.
    pub stale_threshold: Duration,
    /// Intake queue capacity.
    pub queue_max_size: usize,
    /// Most messages per batch window.
    pub max_batch_size: usize,
    /// Batch consumer poll interval.
    pub batch_poll_interval: Duration,
    /// Per-heartbeat timeout, covering the socket write.
    pub heartbeat_timeout: Duration,
    /// Per-connection outbound buffer, in frames.
    pub outbound_buffer_size: usize,
    /// Pause after a failed maintenance iteration.
    pub error_backoff: Duration,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl HubConfig {
    /// Registry limits derived from this config.
    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_per_principal: self.max_connections_per_user,
            policy: self.connection_limit_policy,
        }
    }

    /// Batcher parameters derived from this config.
    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            queue_max_size: self.queue_max_size,
            max_batch_size: self.max_batch_size,
            poll_interval: self.batch_poll_interval,
            error_backoff: self.error_backoff,
        }
    }
}

impl From<&RealtimeSettings> for HubConfig {
    fn from(rt: &RealtimeSettings) -> Self {
        Self {
            max_connections_per_user: rt.max_connections_per_user,
            connection_limit_policy: rt.connection_limit_policy,
            heartbeat_interval: Duration::from_secs(rt.heartbeat_interval_secs),
            cleanup_interval: Duration::from_secs(rt.cleanup_interval_secs),
            stale_threshold: Duration::from_secs(rt.stale_threshold_secs),
            queue_max_size: rt.queue_max_size,
            max_batch_size: rt.max_batch_size,
            batch_poll_interval: Duration::from_millis(rt.batch_poll_interval_ms),
            heartbeat_timeout: Duration::from_millis(rt.heartbeat_timeout_ms),
            outbound_buffer_size: rt.outbound_buffer_size,
            error_backoff: Duration::from_millis(rt.error_backoff_ms),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&HeraldSettings> for HubConfig {
    fn from(settings: &HeraldSettings) -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(settings.server.shutdown_timeout_secs),
            ..Self::from(&settings.realtime)
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&HeraldSettings::default())
    }
}
