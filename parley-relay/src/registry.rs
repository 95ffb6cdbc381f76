//! Process-wide room table.
//!
//! A room is registered exactly while it has members. Membership changes
//! and the empty-room decision happen under one registry lock, so a join
//! racing the last leave of the same room either finds the surviving room
//! or creates a fresh one. It never finds an empty room that is still
//! registered. Lock order is registry, then room. Broadcasts only take the
//! room lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::RoomId;
use crate::room::{ConnectionId, Peer, Room};

/// Maps room ids to live rooms.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer` to the room, creating the room if it does not exist.
    pub fn join_room(&self, room_id: &RoomId, peer: Peer) -> Arc<Room> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(Room::new(room_id.clone()))
            })
            .clone();
        room.join(peer);
        room
    }

    /// Remove a connection from the room, destroying the room if that left
    /// it empty. Returns whether the room was destroyed.
    ///
    /// Unknown rooms and non-members are no-ops.
    pub fn leave_room(&self, room_id: &RoomId, connection: &ConnectionId) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get(room_id) else {
            return false;
        };
        if !room.leave(connection) {
            return false;
        }
        rooms.remove(room_id);
        log::info!("Room {room_id} removed (empty)");
        true
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.lock().get(room_id).cloned()
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.lock().contains_key(room_id)
    }

    /// Members of the room, or 0 if it is not registered.
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.lock().get(room_id).map_or(0, |room| room.member_count())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().keys().cloned().collect()
    }

    /// Consistent view of every room and its member count.
    pub fn room_sizes(&self) -> Vec<(RoomId, usize)> {
        self.rooms
            .lock()
            .iter()
            .map(|(id, room)| (id.clone(), room.member_count()))
            .collect()
    }
}

/// A connection's seat in a room.
///
/// Leaving happens at most once: explicitly through [`Membership::leave`]
/// or when the value is dropped, whichever comes first.
#[derive(Debug)]
pub struct Membership {
    registry: Arc<RoomRegistry>,
    room: Arc<Room>,
    connection: ConnectionId,
    left: bool,
}

impl Membership {
    pub fn join(registry: Arc<RoomRegistry>, room_id: &RoomId, peer: Peer) -> Self {
        let connection = peer.id();
        let room = registry.join_room(room_id, peer);
        Self {
            registry,
            room,
            connection,
            left: false,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    /// Deregister from the room. Later calls do nothing and return `false`.
    pub fn leave(&mut self) -> bool {
        if self.left {
            return false;
        }
        self.left = true;
        self.registry.leave_room(self.room.id(), &self.connection);
        true
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.leave();
    }
}
