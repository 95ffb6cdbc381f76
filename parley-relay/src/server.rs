//! WebSocket relay server with room-based fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                  ┌──► Client A (echo)
//!            ├── ConnectionHandler ── Room ─────┼──► Client B
//! Client B ──┘          │            (ABC123)   └──► ...
//!                       ▼
//!                 RoomRegistry (process-wide, in-memory)
//! ```
//!
//! Each accepted TCP stream gets its own task running a
//! [`ConnectionHandler`]. The registry is the only state those tasks share.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::connection::ConnectionHandler;
use crate::error::RelayError;
use crate::registry::RoomRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before broadcasts to it start failing
    pub outbound_capacity: usize,
    /// Largest accepted WebSocket message or frame, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_bytes))
            .max_frame_size(Some(self.max_frame_bytes))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_ignored: u64,
    pub chats_relayed: u64,
    pub active_rooms: usize,
}

/// Lock-free counters updated by connection handlers.
#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) total_connections: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_ignored: AtomicU64,
    pub(crate) chats_relayed: AtomicU64,
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    counters: Arc<ServerCounters>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(RoomRegistry::new()),
            counters: Arc::new(ServerCounters::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the task is cancelled.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    ///
    /// Accept errors are logged and the loop continues.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");
            self.counters.total_connections.fetch_add(1, Ordering::Relaxed);

            let handler = ConnectionHandler::new(
                addr,
                self.config.clone(),
                self.registry.clone(),
                self.counters.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = handler.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_ignored: self.counters.frames_ignored.load(Ordering::Relaxed),
            chats_relayed: self.counters.chats_relayed.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the room registry shared by all connections.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.max_frame_bytes, 65_536);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.registry().room_count(), 0);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            outbound_capacity: 32,
            max_frame_bytes: 1024,
        };
        let server = RelayServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.config().outbound_capacity, 32);
    }

    #[test]
    fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[test]
    fn test_clones_share_registry() {
        let server = RelayServer::with_defaults();
        let clone = server.clone();
        assert!(Arc::ptr_eq(server.registry(), clone.registry()));
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure() {
        let server = RelayServer::new(ServerConfig {
            bind_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        });
        assert!(matches!(server.run().await, Err(RelayError::Io(_))));
    }
}
