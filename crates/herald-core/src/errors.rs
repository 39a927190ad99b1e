//! Error types for the notification hub.
//!
//! Producers only ever see [`QueueError`] (on enqueue) and
//! [`RegistrationError`] (at connect time). [`TransportError`] stays inside
//! the hub: it causes the failing connection to be dropped and nothing else.

use thiserror::Error;

use crate::scope::Scope;

/// Rejection of a connection before it enters the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// No principal id, or a blank one.
    #[error("principal id is required")]
    MissingPrincipal,
    /// Project scope without a project id.
    #[error("project scope requires a project id")]
    MissingProject,
    /// A project id was supplied for a scope that does not take one.
    #[error("scope '{0}' does not take a project id")]
    UnexpectedProject(Scope),
    /// Unknown scope name.
    #[error("unknown scope '{0}'")]
    InvalidScope(String),
    /// The connection is already registered or already closed.
    #[error("connection {0} is not awaiting registration")]
    AlreadyRegistered(String),
    /// The principal is at its connection cap and the policy rejects.
    #[error("principal {principal_id} already has {limit} connections")]
    TooManyConnections {
        /// The principal at its cap.
        principal_id: String,
        /// Configured cap.
        limit: usize,
    },
    /// The hub has started shutting down and admits no new connections.
    #[error("hub is shutting down")]
    ShuttingDown,
}

/// Rejection of a message at the intake queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is saturated. The producer decides whether to drop, retry,
    /// or slow down.
    #[error("message queue is full ({capacity} pending)")]
    Full {
        /// Queue capacity.
        capacity: usize,
    },
    /// The hub has shut down.
    #[error("message queue is closed")]
    Closed,
}

/// Send failure on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The writer task is gone.
    #[error("connection closed")]
    Closed,
    /// The outbound buffer is full.
    #[error("outbound buffer full")]
    Full,
    /// A heartbeat did not reach the socket in time.
    #[error("send timed out")]
    Timeout,
}

/// Failure inside a scale-out bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Could not reach or talk to the pub/sub backend.
    #[error("bridge backend error: {0}")]
    Backend(String),
    /// A payload could not be encoded or decoded.
    #[error("bridge payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn registration_error_display() {
        assert_eq!(
            RegistrationError::MissingProject.to_string(),
            "project scope requires a project id"
        );
        assert_eq!(
            RegistrationError::UnexpectedProject(Scope::User).to_string(),
            "scope 'user' does not take a project id"
        );
        let err = RegistrationError::TooManyConnections {
            principal_id: "3".into(),
            limit: 2,
        };
        assert_eq!(err.to_string(), "principal 3 already has 2 connections");
    }

    #[test]
    fn queue_error_display() {
        assert_eq!(
            QueueError::Full { capacity: 1000 }.to_string(),
            "message queue is full (1000 pending)"
        );
        assert_eq!(QueueError::Closed.to_string(), "message queue is closed");
    }

    #[test]
    fn bridge_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: BridgeError = json_err.into();
        assert_matches!(err, BridgeError::Payload(_));
    }

    #[test]
    fn transport_error_is_copy() {
        let e = TransportError::Full;
        let f = e;
        assert_eq!(e, f);
    }
}
