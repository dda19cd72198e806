//! # codecast-collab: Room presence and buffer relay for a shared code editor
//!
//! Clients join named rooms over WebSocket, learn who else is there, receive
//! the current buffer from an existing peer, and then see every peer's edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer          │
//! │ (per user)  │     JSON events     │  └ PresenceCoordinator
//! └──────┬──────┘                     │     ├ ConnectionRegistry
//!        │                            │     └ RoomManager (rooms + outboxes)
//!        ▼                            └─────────────────────┘
//! ┌─────────────┐
//! │ buffer      │   authoritative copy lives in the clients;
//! │ (local)     │   the server only relays it
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Event names, typed events, JSON codec
//! - [`registry`]: Connection id → display name
//! - [`broadcast`]: Room membership and per-connection fan-out
//! - [`presence`]: Join / edit / sync / disconnect handling
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client session

pub mod protocol;
pub mod registry;
pub mod broadcast;
pub mod presence;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    actions, ClientEvent, ClientInfo, ConnectionId, ProtocolError, RoomId, ServerEvent,
};
pub use registry::ConnectionRegistry;
pub use broadcast::{BroadcastGroup, BroadcastStats, Delivery, Frame, Mailbox, Outbox, RoomManager};
pub use presence::PresenceCoordinator;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SessionEvent, SyncClient};
