//! WebSocket connection management, liveness, and fan-out.

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod reaper;
pub mod registry;
pub mod session;
