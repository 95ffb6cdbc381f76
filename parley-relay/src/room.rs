//! Room membership and best-effort fan-out.
//!
//! Every member owns a bounded outbound queue drained by its connection's
//! writer task. A broadcast encodes the envelope once, snapshots the member
//! set under the lock and then pushes the shared frame into each queue with
//! `try_send`, outside the lock. A full or closed queue loses that one
//! frame and nothing else: the member stays in the room until its own
//! connection closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Envelope, RoomId, UserName};

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A room's handle on one member connection.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    user: UserName,
    outbound: mpsc::Sender<Message>,
}

impl Peer {
    pub fn new(id: ConnectionId, user: UserName, outbound: mpsc::Sender<Message>) -> Self {
        Self { id, user, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserName {
        &self.user
    }

    /// Queue a frame without waiting. Fails if the queue is full or the
    /// connection's writer has gone away.
    fn deliver(&self, frame: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.outbound.try_send(frame)
    }
}

/// Snapshot of a room's delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    /// Broadcasts performed
    pub messages_sent: u64,
    /// Frames successfully queued to members
    pub deliveries: u64,
    /// Frames lost to full or closed member queues
    pub deliveries_failed: u64,
    pub active_members: usize,
}

#[derive(Debug, Default)]
struct AtomicRoomStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    deliveries_failed: AtomicU64,
}

/// A named group of connections that receive each other's broadcasts.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: Mutex<HashMap<ConnectionId, Peer>>,
    stats: AtomicRoomStats,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: Mutex::new(HashMap::new()),
            stats: AtomicRoomStats::default(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Add a member. Returns `false` (and keeps the existing entry) if the
    /// connection is already a member.
    pub fn join(&self, peer: Peer) -> bool {
        let mut members = self.members.lock();
        if members.contains_key(&peer.id) {
            return false;
        }
        members.insert(peer.id, peer);
        true
    }

    /// Remove a member if present. Returns whether the room is now empty.
    pub fn leave(&self, id: &ConnectionId) -> bool {
        let mut members = self.members.lock();
        members.remove(id);
        members.is_empty()
    }

    /// Encode once and deliver to every current member, the sender included.
    pub fn broadcast(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(text) => self.broadcast_frame(Message::text(text)),
            Err(e) => log::warn!("Room {}: dropping unencodable {} envelope: {e}", self.id, envelope.kind()),
        }
    }

    /// Deliver a pre-encoded frame to every current member.
    ///
    /// Never fails: a member whose queue rejects the frame is skipped.
    pub fn broadcast_frame(&self, frame: Message) {
        let peers: Vec<Peer> = self.members.lock().values().cloned().collect();

        let mut delivered = 0u64;
        let mut failed = 0u64;
        for peer in &peers {
            match peer.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    log::debug!("Room {}: delivery to {} ({}) failed: {e}", self.id, peer.user, peer.id);
                }
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.stats.deliveries_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members.lock().contains_key(id)
    }

    /// Display names of current members.
    pub fn users(&self) -> Vec<UserName> {
        self.members.lock().values().map(|p| p.user.clone()).collect()
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            deliveries_failed: self.stats.deliveries_failed.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }
}
