//! Per-connection control logic.
//!
//! ```text
//! Connecting ──handshake──► Open ──close/error──► Closed
//!                            │ ▲
//!                            └─┘ inbound frame
//! ```
//!
//! On `Open` the handler joins its room and sends a `system` hello to itself
//! only. Every inbound `chat` envelope is broadcast to the room unchanged;
//! everything else is dropped. Leaving the room is tied to a [`Membership`]
//! so it runs exactly once on every exit path.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::RelayError;
use crate::protocol::{Envelope, RoomId, UserName};
use crate::registry::{Membership, RoomRegistry};
use crate::room::{ConnectionId, Peer, Room};
use crate::server::{ServerConfig, ServerCounters};

/// Lifecycle of a connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Connecting,
    Open,
    Closed,
}

/// Room and user requested by a connecting client, after truncation and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub room: RoomId,
    pub user: UserName,
}

impl JoinParams {
    /// Read `room` and `user` from a URL query string such as
    /// `room=ABC123&user=Alice`. Values are percent-decoded; the first
    /// occurrence of each key wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut room = None;
        let mut user = None;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "room" if room.is_none() => room = Some(value.into_owned()),
                "user" if user.is_none() => user = Some(value.into_owned()),
                _ => {}
            }
        }
        Self {
            room: RoomId::resolve(room.as_deref()),
            user: UserName::resolve(user.as_deref()),
        }
    }
}

/// Drives one accepted TCP stream from handshake to cleanup.
pub struct ConnectionHandler {
    id: ConnectionId,
    addr: SocketAddr,
    state: HandlerState,
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    counters: Arc<ServerCounters>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        registry: Arc<RoomRegistry>,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            addr,
            state: HandlerState::Connecting,
            config,
            registry,
            counters,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Run the connection to completion.
    ///
    /// Only handshake failures are returned as errors. Once the connection
    /// is open, closes and transport errors end the session normally.
    pub async fn run(mut self, stream: TcpStream) -> Result<(), RelayError> {
        let mut query: Option<String> = None;
        let capture_query = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().map(str::to_owned);
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            capture_query,
            Some(self.config.websocket_config()),
        )
        .await?;

        let params = JoinParams::from_query(query.as_deref());
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Writer: drains this connection's outbound queue into the socket.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(self.config.outbound_capacity);
        let addr = self.addr;
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = ws_sender.send(frame).await {
                    log::debug!("Writer for {addr} stopped: {e}");
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let peer = Peer::new(self.id, params.user.clone(), outbound_tx.clone());
        let mut membership = Membership::join(self.registry.clone(), &params.room, peer);
        self.state = HandlerState::Open;
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "{} ({}) joined room {} from {}",
            params.user,
            self.id,
            params.room,
            self.addr
        );

        match Envelope::hello(&params.room, &params.user).encode() {
            Ok(hello) => {
                if outbound_tx.send(Message::text(hello)).await.is_err() {
                    log::debug!("Connection {} closed before hello", self.id);
                }
            }
            Err(e) => log::warn!("Failed to encode hello for {}: {e}", self.id),
        }

        let room = membership.room().clone();
        self.relay(&mut ws_receiver, &room).await;

        self.close(&mut membership);
        log::info!("{} ({}) left room {}", params.user, self.id, params.room);

        // The room no longer holds our sender; dropping ours ends the writer.
        drop(membership);
        drop(outbound_tx);
        let _ = writer.await;
        Ok(())
    }

    /// Forward inbound frames until the transport closes or fails.
    async fn relay<S>(&self, ws_receiver: &mut S, room: &Room)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    self.on_text(text.as_str(), room);
                }
                Ok(Message::Binary(_)) => {
                    self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    self.counters.frames_ignored.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Ignoring binary frame from {}", self.id);
                }
                Ok(Message::Close(_)) => {
                    log::debug!("Close frame from {}", self.addr);
                    break;
                }
                // Pings are answered by the protocol layer
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Transport error from {}: {e}", self.addr);
                    break;
                }
            }
        }
    }

    fn on_text(&self, text: &str, room: &Room) {
        match Envelope::decode(text) {
            Ok(Some(envelope @ Envelope::Chat(_))) => {
                self.counters.chats_relayed.fetch_add(1, Ordering::Relaxed);
                room.broadcast(&envelope);
            }
            Ok(Some(other)) => {
                self.counters.frames_ignored.fetch_add(1, Ordering::Relaxed);
                log::debug!("Ignoring client-sent {} envelope from {}", other.kind(), self.id);
            }
            Ok(None) => {
                self.counters.frames_ignored.fetch_add(1, Ordering::Relaxed);
                log::debug!("Ignoring unrecognised envelope from {}", self.id);
            }
            Err(e) => {
                self.counters.frames_ignored.fetch_add(1, Ordering::Relaxed);
                log::debug!("Ignoring malformed frame from {}: {e}", self.id);
            }
        }
    }

    /// `Open → Closed`. Repeated calls are no-ops.
    fn close(&mut self, membership: &mut Membership) {
        if self.state == HandlerState::Closed {
            return;
        }
        self.state = HandlerState::Closed;
        membership.leave();
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_params_defaults() {
        let params = JoinParams::from_query(None);
        assert_eq!(params.room.as_str(), "public");
        assert_eq!(params.user.as_str(), "Guest");

        let params = JoinParams::from_query(Some("room=&user="));
        assert_eq!(params.room.as_str(), "public");
        assert_eq!(params.user.as_str(), "Guest");
    }

    #[test]
    fn test_join_params_reads_both_keys() {
        let params = JoinParams::from_query(Some("room=ABC123&user=Alice"));
        assert_eq!(params.room.as_str(), "ABC123");
        assert_eq!(params.user.as_str(), "Alice");
    }

    #[test]
    fn test_join_params_percent_decodes() {
        let params = JoinParams::from_query(Some("room=caf%C3%A9&user=Ana+Maria"));
        assert_eq!(params.room.as_str(), "café");
        assert_eq!(params.user.as_str(), "Ana Maria");
    }

    #[test]
    fn test_join_params_truncates() {
        let query = format!("room={}&user={}", "A".repeat(30), "b".repeat(30));
        let params = JoinParams::from_query(Some(&query));
        assert_eq!(params.room.as_str(), "A".repeat(24));
        assert_eq!(params.user.as_str(), "b".repeat(24));
    }

    #[test]
    fn test_join_params_first_value_wins() {
        let params = JoinParams::from_query(Some("user=Alice&user=Mallory&other=1"));
        assert_eq!(params.user.as_str(), "Alice");
        assert_eq!(params.room.as_str(), "public");
    }

    #[test]
    fn test_handler_starts_connecting() {
        let handler = ConnectionHandler::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(ServerConfig::default()),
            Arc::new(RoomRegistry::new()),
            Arc::new(ServerCounters::default()),
        );
        assert_eq!(handler.state(), HandlerState::Connecting);
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = Arc::new(RoomRegistry::new());
        let counters = Arc::new(ServerCounters::default());
        let mut handler = ConnectionHandler::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(ServerConfig::default()),
            registry.clone(),
            counters.clone(),
        );
        let (tx, _rx) = mpsc::channel(4);
        let room = RoomId::resolve(Some("ABC123"));
        let peer = Peer::new(handler.id(), UserName::resolve(Some("Alice")), tx);
        let mut membership = Membership::join(registry.clone(), &room, peer);
        handler.state = HandlerState::Open;
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        handler.close(&mut membership);
        handler.close(&mut membership);

        assert_eq!(handler.state(), HandlerState::Closed);
        assert!(!registry.contains(&room));
        assert_eq!(counters.active_connections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_on_text_relays_only_chat() {
        let registry = Arc::new(RoomRegistry::new());
        let counters = Arc::new(ServerCounters::default());
        let handler = ConnectionHandler::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(ServerConfig::default()),
            registry.clone(),
            counters.clone(),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let room = registry.join_room(
            &RoomId::resolve(Some("ABC123")),
            Peer::new(handler.id(), UserName::resolve(Some("Alice")), tx),
        );

        handler.on_text("not json", &room);
        handler.on_text(r#"{"type":"unknown"}"#, &room);
        handler.on_text(r#"{"type":"system","payload":{"hello":true}}"#, &room);
        assert!(rx.try_recv().is_err());

        handler.on_text(
            r#"{"type":"chat","payload":{"id":"1","user":"Alice","text":"hi","modality":"text","timestamp":5}}"#,
            &room,
        );
        assert!(rx.try_recv().is_ok());
        assert_eq!(counters.chats_relayed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.frames_ignored.load(Ordering::Relaxed), 3);
    }
}
