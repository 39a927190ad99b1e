//! # herald-server
//!
//! Real-time notification hub and its Axum `WebSocket` gateway.
//!
//! - Connection registry indexed by principal, project and dashboard scope
//! - Direct fan-out (`send_to_user`, `send_to_project`, `send_to_dashboard`,
//!   `broadcast_to_user_projects`) and a bounded, batched intake queue
//! - Heartbeat monitor and stale reaper on a shared `CancellationToken`
//! - Optional scale-out bridge (`redis` feature) for multi-process fan-out
//! - HTTP endpoints: `/ws`, `/health`, `/stats`, `/metrics`

#![deny(unsafe_code)]

pub mod batcher;
pub mod bridge;
pub mod config;
pub mod health;
pub mod hub;
pub mod maintenance;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::HubConfig;
pub use hub::{Hub, HubError, HubStats};
pub use server::HeraldServer;
