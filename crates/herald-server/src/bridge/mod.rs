//! Cross-process fan-out.
//!
//! The hub never calls a bridge on its local delivery path. Publishing is a
//! separate operation, and messages arriving from other processes re-enter
//! through the local intake queue via the subscribe callback. A bridge that
//! listens in the background hands back its task so the hub can stop it.

#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_core::{BridgeError, Envelope, Target};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "redis")]
pub use self::redis::RedisBridge;

/// Called for every message received from another process.
pub type BridgeCallback = Arc<dyn Fn(Target, Envelope) + Send + Sync>;

/// Pub/sub transport shared by several hub processes.
#[async_trait]
pub trait ScaleOutBridge: Send + Sync {
    /// Short backend name for logs and `/stats`.
    fn name(&self) -> &'static str;

    /// Announce a message to the other processes.
    async fn publish(&self, target: &Target, envelope: &Envelope) -> Result<(), BridgeError>;

    /// Start receiving messages published by other processes.
    ///
    /// Delivery stops once `cancel` fires. A bridge that listens on a
    /// background task returns its handle; one that does not returns `None`.
    async fn subscribe(
        &self,
        callback: BridgeCallback,
        cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, BridgeError>;
}

/// Wire payload exchanged between processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgePayload {
    /// Instance id of the publishing process.
    pub origin: String,
    /// Where the message goes.
    pub target: Target,
    /// The frame to deliver.
    pub envelope: Envelope,
}

impl BridgePayload {
    /// JSON text published on the channel.
    pub fn encode(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a received payload, returning `None` for messages this process
    /// published itself.
    pub fn decode_foreign(raw: &str, own_origin: &str) -> Result<Option<Self>, BridgeError> {
        let payload: Self = serde_json::from_str(raw)?;
        Ok((payload.origin != own_origin).then_some(payload))
    }
}

const RESUBSCRIBE_BASE: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Pause before resubscribing after the `attempt`-th consecutive failure
/// (0-based): doubles from 500ms, capped at 30s.
pub fn resubscribe_delay(attempt: u32) -> Duration {
    RESUBSCRIBE_BASE
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(RESUBSCRIBE_MAX)
}

/// Single-process bridge: publishing and subscribing do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalBridge;

#[async_trait]
impl ScaleOutBridge for LocalBridge {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, _target: &Target, _envelope: &Envelope) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn subscribe(
        &self,
        _callback: BridgeCallback,
        _cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, BridgeError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};

    fn payload(origin: &str) -> BridgePayload {
        BridgePayload {
            origin: origin.into(),
            target: Target::User("3".into()),
            envelope: Envelope::user_message("hi"),
        }
    }

    #[tokio::test]
    async fn local_bridge_is_noop() {
        let bridge = LocalBridge;
        bridge
            .publish(&Target::Dashboard, &Envelope::heartbeat())
            .await
            .unwrap();
        let handle = bridge
            .subscribe(Arc::new(|_, _| {}), CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(bridge.name(), "local");
    }

    // ─── Decode ───

    #[test]
    fn own_publications_are_skipped() {
        let raw = payload("node-a").encode().unwrap();
        assert!(BridgePayload::decode_foreign(&raw, "node-a").unwrap().is_none());
    }

    #[test]
    fn foreign_publications_are_kept() {
        let raw = payload("node-a").encode().unwrap();
        let decoded = BridgePayload::decode_foreign(&raw, "node-b").unwrap().unwrap();
        assert_eq!(decoded.target, Target::User("3".into()));
        assert_eq!(decoded.envelope.fields["message"], "hi");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert_matches!(
            BridgePayload::decode_foreign("not json", "node-a"),
            Err(BridgeError::Payload(_))
        );
        assert_matches!(
            BridgePayload::decode_foreign(r#"{"origin":"x"}"#, "node-a"),
            Err(BridgeError::Payload(_))
        );
    }

    // ─── Resubscribe backoff ───

    #[test]
    fn resubscribe_delay_doubles() {
        assert_eq!(resubscribe_delay(0), Duration::from_millis(500));
        assert_eq!(resubscribe_delay(1), Duration::from_secs(1));
        assert_eq!(resubscribe_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn resubscribe_delay_is_capped() {
        assert_eq!(resubscribe_delay(6), Duration::from_secs(30));
        assert_eq!(resubscribe_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn payload_wire_shape() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let payload = BridgePayload {
            origin: "node-a".into(),
            target: Target::Project("7".into()),
            envelope: Envelope::task_progress("t1", 42, "running").stamped(at),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["target"]["scope"], "project");
        assert_eq!(json["target"]["id"], "7");
        assert_eq!(json["envelope"]["type"], "task_progress");
        assert_eq!(json["envelope"]["timestamp"], "2026-01-02T03:04:05.000Z");

        let back: BridgePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
