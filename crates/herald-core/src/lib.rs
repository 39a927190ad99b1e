//! # herald-core
//!
//! Foundation types, errors, branded IDs, and logging for the Herald
//! notification hub.
//!
//! - **Branded IDs**: `ConnectionId`, `PrincipalId`, `ProjectId`
//! - **Scopes**: `Scope`, the tagged `ScopeBinding`, and delivery `Target`s
//! - **Envelopes**: the outbound frame shape (`Envelope`, `MessageType`) and
//!   the queued `Message`
//! - **Errors**: `RegistrationError`, `QueueError`, `TransportError`,
//!   `BridgeError` via `thiserror`
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod scope;

pub use envelope::{Envelope, Message, MessageType};
pub use errors::{BridgeError, QueueError, RegistrationError, TransportError};
pub use ids::{ConnectionId, PrincipalId, ProjectId};
pub use scope::{Scope, ScopeBinding, Target};
