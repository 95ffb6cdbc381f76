//! WebSocket client for talking to a relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Chat send with a fresh message id and timestamp
//! - Decoded inbound events on an mpsc channel
//!
//! The client never appends its own messages locally. It waits for the
//! server's echo, so every member of a room sees the same order.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::RelayError;
use crate::protocol::{ChatMessage, Envelope, Modality, RoomId, UserName};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Server acknowledged the join
    Hello { room: String, user: String },
    /// A chat broadcast, including echoes of our own messages
    Chat(ChatMessage),
    /// Any other server metadata
    System(Value),
    /// Connection lost
    Disconnected,
}

impl RelayEvent {
    fn from_envelope(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Chat(message) => Self::Chat(message),
            Envelope::System(payload) => {
                if payload.get("hello").and_then(Value::as_bool) == Some(true) {
                    let field = |key: &str| {
                        payload
                            .get(key)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned()
                    };
                    Self::Hello {
                        room: field("room"),
                        user: field("user"),
                    }
                } else {
                    Self::System(payload)
                }
            }
        }
    }
}

/// The relay client.
pub struct RelayClient {
    room: RoomId,
    user: UserName,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RelayEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<RelayEvent>,

    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,
}

impl RelayClient {
    /// Create a client for `room` as `user`. Both are truncated and
    /// defaulted the same way the server does it.
    pub fn new(server_url: impl Into<String>, room: &str, user: &str) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            room: RoomId::resolve(Some(room)),
            user: UserName::resolve(Some(user)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn user(&self) -> &UserName {
        &self.user
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Full session URL with the `room` and `user` query parameters.
    pub fn session_url(&self) -> Result<Url, RelayError> {
        let mut url = Url::parse(&self.server_url)?;
        url.query_pairs_mut()
            .append_pair("room", self.room.as_str())
            .append_pair("user", self.user.as_str());
        Ok(url)
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        let url = self.session_url()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match Envelope::decode(text.as_str()) {
                    Ok(Some(envelope)) => {
                        if event_tx.send(RelayEvent::from_envelope(envelope)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => log::debug!("Ignoring unrecognised envelope from server"),
                    Err(e) => log::warn!("Ignoring malformed frame from server: {e}"),
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        log::info!("Connected to {} as {} in room {}", self.server_url, self.user, self.room);
        Ok(())
    }

    /// Author and send a chat message. Returns the message as sent.
    pub async fn send_chat(
        &self,
        text: impl Into<String>,
        modality: Modality,
    ) -> Result<ChatMessage, RelayError> {
        let message = ChatMessage::new(self.user.as_str(), text, modality);
        let frame = Envelope::Chat(message.clone()).encode()?;
        self.send_text(frame).await?;
        Ok(message)
    }

    /// Send a raw text frame.
    pub async fn send_text(&self, frame: impl Into<String>) -> Result<(), RelayError> {
        let tx = self.outgoing_tx.as_ref().ok_or(RelayError::NotConnected)?;
        tx.send(Message::text(frame.into()))
            .await
            .map_err(|_| RelayError::NotConnected)
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}
