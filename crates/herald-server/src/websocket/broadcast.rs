//! Addressed fan-out to registered connections.

use std::sync::Arc;

use chrono::Utc;
use herald_core::{ConnectionId, Envelope, PrincipalId, ProjectId, Target, TransportError};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use super::registry::ConnectionRegistry;
use crate::metrics::{WS_BROADCAST_FAILURES_TOTAL, WS_FRAMES_SENT_TOTAL};

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections the frame was offered to.
    pub attempted: usize,
    /// Connections that accepted it.
    pub delivered: usize,
    /// Connections whose buffer was full. The frame was dropped for them but
    /// the connection stays registered.
    pub dropped: usize,
    /// Connections whose writer was gone; they were disconnected.
    pub failed: usize,
}

/// Where drained batches are handed for delivery.
pub trait FrameSink: Send + Sync {
    /// Offer `envelope` to every recipient of `target`.
    fn deliver(&self, target: &Target, envelope: Envelope) -> DeliveryReport;
}

/// Sends frames to every connection matching a target.
///
/// A failing connection never affects the others: the whole snapshot is
/// attempted first, then only the closed subset is force-disconnected. A
/// slow client with a full buffer loses the frame and keeps its connection;
/// the heartbeat monitor and reaper judge whether it is still alive.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver to the user-scope connections of one principal.
    pub fn send_to_user(&self, principal_id: &PrincipalId, envelope: Envelope) -> DeliveryReport {
        self.deliver(&Target::User(principal_id.clone()), envelope)
    }

    /// Deliver to every connection bound to one project.
    pub fn send_to_project(&self, project_id: &ProjectId, envelope: Envelope) -> DeliveryReport {
        self.deliver(&Target::Project(project_id.clone()), envelope)
    }

    /// Deliver to every dashboard connection.
    pub fn send_to_dashboard(&self, envelope: Envelope) -> DeliveryReport {
        self.deliver(&Target::Dashboard, envelope)
    }

    /// Deliver to every project-scope connection the principal owns.
    pub fn broadcast_to_user_projects(
        &self,
        principal_id: &PrincipalId,
        envelope: Envelope,
    ) -> DeliveryReport {
        self.deliver(&Target::UserProjects(principal_id.clone()), envelope)
    }

    /// Stamp, encode once, and offer the frame to every recipient of `target`.
    pub fn deliver(&self, target: &Target, envelope: Envelope) -> DeliveryReport {
        let kind = envelope.kind.as_str();
        let frame = Arc::new(envelope.stamped(Utc::now()).encode());
        let recipients = self.registry.lookup(target);

        let mut report = DeliveryReport {
            attempted: recipients.len(),
            ..DeliveryReport::default()
        };
        let mut failed: Vec<ConnectionId> = Vec::new();
        for conn in &recipients {
            match conn.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TransportError::Full) => {
                    debug!(conn_id = %conn.id, %target, "outbound buffer full, frame dropped");
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!(conn_id = %conn.id, %target, error = %e, "send failed, dropping connection");
                    failed.push(conn.id.clone());
                }
            }
        }

        for id in &failed {
            let _ = self.registry.force_disconnect(id);
        }
        report.failed = failed.len();

        counter!(WS_FRAMES_SENT_TOTAL).increment(report.delivered as u64);
        if report.failed > 0 {
            counter!(WS_BROADCAST_FAILURES_TOTAL).increment(report.failed as u64);
        }
        debug!(
            %target,
            kind,
            attempted = report.attempted,
            delivered = report.delivered,
            dropped = report.dropped,
            failed = report.failed,
            "broadcast"
        );
        report
    }
}

impl FrameSink for Broadcaster {
    fn deliver(&self, target: &Target, envelope: Envelope) -> DeliveryReport {
        Broadcaster::deliver(self, target, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ClientConnection;
    use herald_core::Scope;
    use tokio::sync::mpsc;

    struct Client {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        fn frames(&mut self) -> Vec<serde_json::Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
        scope: Scope,
        principal: &str,
        project: Option<&str>,
    ) -> Client {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(ClientConnection::new(tx));
        let _ = registry
            .register(conn.clone(), scope, principal.into(), project.map(Into::into))
            .unwrap();
        Client { conn, rx }
    }

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::default());
        let broadcaster = Broadcaster::new(registry.clone());
        (registry, broadcaster)
    }

    #[test]
    fn failed_connection_is_isolated() {
        let (registry, broadcaster) = setup();
        let a = connect(&registry, Scope::Project, "1", Some("7"));
        let mut b = connect(&registry, Scope::Project, "2", Some("7"));
        let mut c = connect(&registry, Scope::Project, "3", Some("7"));
        let a_conn = a.conn.clone();
        drop(a);

        let report = broadcaster.send_to_project(&"7".into(), Envelope::user_message("hi"));

        assert_eq!(
            report,
            DeliveryReport {
                attempted: 3,
                delivered: 2,
                dropped: 0,
                failed: 1
            }
        );
        assert_eq!(b.frames().len(), 1);
        assert_eq!(c.frames().len(), 1);
        assert!(!registry.contains(&a_conn.id));
        assert!(a_conn.is_closed());
        assert!(registry.contains(&b.conn.id));
        assert!(registry.contains(&c.conn.id));
    }

    #[test]
    fn project_delivery_reaches_only_that_project() {
        let (registry, broadcaster) = setup();
        let mut target = connect(&registry, Scope::Project, "3", Some("7"));
        let mut other_project = connect(&registry, Scope::Project, "3", Some("8"));
        let mut user = connect(&registry, Scope::User, "3", None);

        let report =
            broadcaster.send_to_project(&"7".into(), Envelope::task_progress("job-1", 42, "running"));
        assert_eq!(report.delivered, 1);

        let frames = target.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "task_progress");
        assert_eq!(frames[0]["percent"], 42);
        assert!(frames[0]["timestamp"].is_string());
        assert!(other_project.frames().is_empty());
        assert!(user.frames().is_empty());
    }

    #[test]
    fn send_after_disconnect_is_a_noop() {
        let (registry, broadcaster) = setup();
        let client = connect(&registry, Scope::Project, "3", Some("7"));
        assert!(registry.unregister(&client.conn.id));
        let before = registry.stats();

        let report = broadcaster.send_to_project(&"7".into(), Envelope::task_progress("j", 42, "running"));

        assert_eq!(report, DeliveryReport::default());
        assert_eq!(registry.stats(), before);
    }

    #[test]
    fn dashboard_delivery_skips_user_scope() {
        let (registry, broadcaster) = setup();
        let mut dash = connect(&registry, Scope::Dashboard, "3", None);
        let mut user = connect(&registry, Scope::User, "3", None);

        let report = broadcaster.send_to_dashboard(Envelope::new(herald_core::MessageType::ProjectUpdate));
        assert_eq!(report.delivered, 1);
        assert_eq!(dash.frames().len(), 1);
        assert!(user.frames().is_empty());
    }

    #[test]
    fn user_delivery_skips_other_scopes() {
        let (registry, broadcaster) = setup();
        let mut user = connect(&registry, Scope::User, "3", None);
        let mut dash = connect(&registry, Scope::Dashboard, "3", None);
        let mut other = connect(&registry, Scope::User, "4", None);

        let _ = broadcaster.send_to_user(&"3".into(), Envelope::user_message("hello"));
        let frames = user.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["message"], "hello");
        assert!(dash.frames().is_empty());
        assert!(other.frames().is_empty());
    }

    #[test]
    fn user_projects_fan_out() {
        let (registry, broadcaster) = setup();
        let mut p7 = connect(&registry, Scope::Project, "3", Some("7"));
        let mut p8 = connect(&registry, Scope::Project, "3", Some("8"));
        let mut foreign = connect(&registry, Scope::Project, "4", Some("7"));
        let mut user = connect(&registry, Scope::User, "3", None);

        let report = broadcaster
            .broadcast_to_user_projects(&"3".into(), Envelope::project_update("*", "archived"));
        assert_eq!(report.delivered, 2);
        assert_eq!(p7.frames().len(), 1);
        assert_eq!(p8.frames().len(), 1);
        assert!(foreign.frames().is_empty());
        assert!(user.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_send_leaves_heartbeat_alone() {
        let (registry, broadcaster) = setup();
        let client = connect(&registry, Scope::User, "3", None);
        tokio::time::advance(std::time::Duration::from_secs(100)).await;
        let report = broadcaster.send_to_user(&"3".into(), Envelope::user_message("x"));
        assert_eq!(report.delivered, 1);
        assert!(client.conn.last_heartbeat_elapsed() >= std::time::Duration::from_secs(100));
    }

    #[test]
    fn full_buffer_drops_frame_but_keeps_connection() {
        let (registry, broadcaster) = setup();
        let (tx, mut rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(tx));
        let _ = registry
            .register(conn.clone(), Scope::User, "3".into(), None)
            .unwrap();

        let first = broadcaster.send_to_user(&"3".into(), Envelope::user_message("1"));
        let second = broadcaster.send_to_user(&"3".into(), Envelope::user_message("2"));
        assert_eq!(first.delivered, 1);
        assert_eq!(
            second,
            DeliveryReport {
                attempted: 1,
                delivered: 0,
                dropped: 1,
                failed: 0
            }
        );
        assert!(registry.contains(&conn.id));
        assert!(!conn.is_closed());
        assert_eq!(conn.drop_count(), 1);

        let _ = rx.try_recv().unwrap();
        let third = broadcaster.send_to_user(&"3".into(), Envelope::user_message("3"));
        assert_eq!(third.delivered, 1);
    }

    #[test]
    fn broadcaster_is_a_frame_sink() {
        let (registry, broadcaster) = setup();
        let mut dash = connect(&registry, Scope::Dashboard, "3", None);
        let sink: &dyn FrameSink = &broadcaster;
        let report = sink.deliver(&Target::Dashboard, Envelope::user_message("x"));
        assert_eq!(report.delivered, 1);
        assert_eq!(dash.frames().len(), 1);
    }
}
