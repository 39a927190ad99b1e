//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may contain any subset of fields.

mod realtime;
mod server;

pub use realtime::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "realtime": { "maxBatchSize": 25, "connectionLimitPolicy": "reject" },
///   "bridge": { "redisUrl": "redis://127.0.0.1:6379" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Connection, heartbeat, reaper and batching settings.
    pub realtime: RealtimeSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Scale-out bridge configuration.
    pub bridge: BridgeSettings,
}

impl HeraldSettings {
    /// Reject combinations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rt = &self.realtime;
        let positive = [
            ("maxConnectionsPerUser", rt.max_connections_per_user as u64),
            ("heartbeatIntervalSeconds", rt.heartbeat_interval_secs),
            ("cleanupIntervalSeconds", rt.cleanup_interval_secs),
            ("staleThresholdSeconds", rt.stale_threshold_secs),
            ("queueMaxSize", rt.queue_max_size as u64),
            ("maxBatchSize", rt.max_batch_size as u64),
            ("batchPollIntervalMs", rt.batch_poll_interval_ms),
            ("heartbeatTimeoutMs", rt.heartbeat_timeout_ms),
            ("outboundBufferSize", rt.outbound_buffer_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        if rt.max_batch_size > rt.queue_max_size {
            return Err(SettingsError::InvalidValue(format!(
                "maxBatchSize ({}) exceeds queueMaxSize ({})",
                rt.max_batch_size, rt.queue_max_size
            )));
        }
        if rt.stale_threshold_secs <= rt.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "staleThresholdSeconds ({}) must exceed heartbeatIntervalSeconds ({})",
                rt.stale_threshold_secs, rt.heartbeat_interval_secs
            )));
        }
        if self.bridge.channel.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "bridge channel must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
