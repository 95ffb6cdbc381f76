//! # parley-relay: real-time room relay for Parley
//!
//! Accepts WebSocket connections, groups them into named rooms and fans out
//! chat messages to every member of a room, the sender included.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌───────────────────┐
//! │ RelayClient │ ◄─────────────────► │ ConnectionHandler │ (one task each)
//! │ (per user)  │   JSON envelopes    └─────────┬─────────┘
//! └─────────────┘                               │ join / leave
//!                                               ▼
//!                                     ┌───────────────────┐
//!                                     │   RoomRegistry    │
//!                                     └─────────┬─────────┘
//!                                               │
//!                                     ┌─────────┴─────────┐
//!                                     │ Room (fan-out)    │
//!                                     └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope codec (`chat` / `system`)
//! - [`room`]: membership and best-effort broadcast
//! - [`registry`]: room lifecycle (create on first join, destroy on last leave)
//! - [`connection`]: per-connection state machine
//! - [`server`]: accept loop and configuration
//! - [`client`]: connector used by chat front-ends and tests
//!
//! Delivery is best effort while a peer's connection is alive. Nothing is
//! persisted, and rooms live only in this process.

pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use client::{ConnectionState, RelayClient, RelayEvent};
pub use connection::{ConnectionHandler, HandlerState, JoinParams};
pub use error::RelayError;
pub use protocol::{ChatMessage, CodecError, Envelope, Modality, RoomId, UserName};
pub use registry::{Membership, RoomRegistry};
pub use room::{ConnectionId, Peer, Room, RoomStats};
pub use server::{RelayServer, ServerConfig, ServerStats};
