//! The hub: one explicitly constructed service owning the registry, the
//! broadcaster, the batcher, the maintenance loops and the bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use herald_core::{
    BridgeError, Envelope, Message, PrincipalId, ProjectId, QueueError, Target,
};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batcher::MessageBatcher;
use crate::bridge::{BridgeCallback, ScaleOutBridge};
use crate::config::HubConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::{Broadcaster, DeliveryReport};
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::reaper::StaleReaper;
use crate::websocket::registry::{ConnectionRegistry, RegistryStats};

/// Errors from hub lifecycle calls.
#[derive(Debug, Error)]
pub enum HubError {
    /// `start` was called twice.
    #[error("hub already started")]
    AlreadyStarted,
    /// The bridge refused to subscribe.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Snapshot for `/stats`.
#[derive(Clone, Debug, Serialize)]
pub struct HubStats {
    /// Connection counts.
    pub connections: RegistryStats,
    /// Messages waiting in the intake queue.
    pub queue_depth: usize,
    /// Intake queue capacity.
    pub queue_capacity: usize,
    /// Bridge backend name.
    pub bridge: &'static str,
}

/// Real-time notification hub.
pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    batcher: Arc<MessageBatcher>,
    bridge: Arc<dyn ScaleOutBridge>,
    shutdown: ShutdownCoordinator,
    started: AtomicBool,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build a hub. Nothing runs until [`start`](Self::start).
    pub fn new(config: HubConfig, bridge: Arc<dyn ScaleOutBridge>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.limits()));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let batcher = Arc::new(MessageBatcher::new(config.batcher(), broadcaster.clone()));
        Self {
            config,
            registry,
            broadcaster,
            batcher,
            bridge,
            shutdown: ShutdownCoordinator::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the batch consumer, heartbeat monitor and reaper, and subscribe
    /// to the bridge.
    pub async fn start(&self) -> Result<(), HubError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HubError::AlreadyStarted);
        }
        let cancel = self.shutdown.token();
        let backoff = self.config.error_backoff;

        let heartbeat = Arc::new(HeartbeatMonitor::new(
            self.registry.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
        ));
        let reaper = Arc::new(StaleReaper::new(
            self.registry.clone(),
            self.config.cleanup_interval,
            self.config.stale_threshold,
        ));
        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(self.batcher.clone().run(cancel.clone())));
            tasks.push(tokio::spawn(heartbeat.run(backoff, cancel.clone())));
            tasks.push(tokio::spawn(reaper.run(backoff, cancel)));
        }

        let batcher = Arc::downgrade(&self.batcher);
        let callback: BridgeCallback = Arc::new(move |target, envelope| {
            if let Some(batcher) = batcher.upgrade() {
                if let Err(e) = batcher.enqueue(Message::new(target, envelope)) {
                    warn!(error = %e, "dropping bridged message");
                }
            }
        });
        if let Some(listener) = self.bridge.subscribe(callback, self.shutdown.token()).await? {
            self.tasks.lock().push(listener);
        }

        info!(bridge = self.bridge.name(), "hub started");
        Ok(())
    }

    /// Tell every client to reconnect, close every connection, and stop the
    /// background loops. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = Arc::new(
            Envelope::reconnect("server_shutdown")
                .stamped(Utc::now())
                .encode(),
        );
        let count = self.registry.close_all(&frame);
        info!(connections = count, "hub shutting down");

        let handles = std::mem::take(&mut *self.tasks.lock());
        self.shutdown
            .graceful_shutdown(handles, Some(self.config.shutdown_timeout))
            .await;
        info!("hub stopped");
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Queue a message for batched delivery.
    pub fn enqueue(&self, target: Target, envelope: Envelope) -> Result<(), QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::Closed);
        }
        self.batcher.enqueue(Message::new(target, envelope))
    }

    /// Deliver immediately to a principal's user-scope connections.
    pub fn send_to_user(&self, principal_id: &PrincipalId, envelope: Envelope) -> DeliveryReport {
        self.broadcaster.send_to_user(principal_id, envelope)
    }

    /// Deliver immediately to a project's connections.
    pub fn send_to_project(&self, project_id: &ProjectId, envelope: Envelope) -> DeliveryReport {
        self.broadcaster.send_to_project(project_id, envelope)
    }

    /// Deliver immediately to dashboard connections.
    pub fn send_to_dashboard(&self, envelope: Envelope) -> DeliveryReport {
        self.broadcaster.send_to_dashboard(envelope)
    }

    /// Deliver immediately to every project connection of a principal.
    pub fn broadcast_to_user_projects(
        &self,
        principal_id: &PrincipalId,
        envelope: Envelope,
    ) -> DeliveryReport {
        self.broadcaster
            .broadcast_to_user_projects(principal_id, envelope)
    }

    /// Announce a message to other hub processes through the bridge.
    pub async fn publish(&self, target: &Target, envelope: &Envelope) -> Result<(), BridgeError> {
        self.bridge.publish(target, envelope).await
    }

    /// Current counts.
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.stats(),
            queue_depth: self.batcher.depth(),
            queue_capacity: self.batcher.capacity(),
            bridge: self.bridge.name(),
        }
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
