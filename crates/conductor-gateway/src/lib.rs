//! Observer gateway: subscription-scoped fan-out of orchestration events over
//! WebSocket.
//!
//! # Main types
//!
//! - [`GatewayServer`] — axum router serving `/ws` and `/health`.
//! - [`NotificationBus`] — relays core events to subscribers and answers requests.
//! - [`ConnectionManager`] — live connections and their channel subscriptions.
//! - [`GatewayBackend`] — snapshots and on-demand runs, implemented for `Orchestrator`.

/// Event relay, request handling and heartbeats.
pub mod bus;
/// Connection registry and per-connection subscriptions.
pub mod connection;
/// Inbound and outbound wire messages.
pub mod protocol;
/// HTTP and WebSocket server.
pub mod server;
/// Channel snapshots served to observers.
pub mod snapshot;

pub use bus::{NotificationBus, DEFAULT_HEARTBEAT};
pub use connection::{Connection, ConnectionManager};
pub use protocol::{InboundMessage, OutboundMessage};
pub use server::{GatewayConfig, GatewayServer};
pub use snapshot::GatewayBackend;
