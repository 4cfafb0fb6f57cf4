use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};

use crate::realtime::events::{Frame, Room, UserJoin, USER_JOIN};

pub type PeerId = u64;

/// Connection registry of the relay. Knows sockets and room names, nothing
/// about users or conversations beyond the `user:join` convention.
pub struct RelayHub {
    registry: RwLock<Registry>,
    next_peer: AtomicU64,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<PeerId, mpsc::Sender<String>>,
    rooms: HashMap<String, HashSet<PeerId>>,
}

/// What the hub did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Joined,
    Routed { delivered: usize, dropped: usize },
    Rejected,
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_peer: AtomicU64::new(1),
        }
    }

    pub async fn register(&self, sender: mpsc::Sender<String>) -> PeerId {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.registry.write().await.peers.insert(id, sender);
        tracing::info!("Peer registered: {}", id);
        id
    }

    /// Removes the peer and prunes it from every room it joined.
    pub async fn unregister(&self, peer: PeerId) {
        let mut registry = self.registry.write().await;
        registry.peers.remove(&peer);
        registry.rooms.retain(|_, members| {
            members.remove(&peer);
            !members.is_empty()
        });
        tracing::info!("Peer unregistered: {}", peer);
    }

    pub async fn join(&self, peer: PeerId, room: &Room) {
        let mut registry = self.registry.write().await;
        if !registry.peers.contains_key(&peer) {
            return;
        }
        registry
            .rooms
            .entry(room.as_str().to_string())
            .or_default()
            .insert(peer);
        tracing::debug!("Peer {} joined {}", peer, room);
    }

    /// Handles one text frame from `from`. Joins are consumed here; anything
    /// else is forwarded verbatim.
    pub async fn dispatch(&self, from: PeerId, text: &str) -> Dispatch {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Dropping unparseable frame from {}: {}", from, e);
                return Dispatch::Rejected;
            }
        };

        if frame.event == USER_JOIN {
            return match serde_json::from_value::<UserJoin>(frame.data) {
                Ok(join) => {
                    self.join(from, &Room::user(join.user_id)).await;
                    Dispatch::Joined
                }
                Err(e) => {
                    tracing::debug!("Invalid join from {}: {}", from, e);
                    Dispatch::Rejected
                }
            };
        }

        self.route(from, frame.room.as_deref(), text).await
    }

    /// Sends `text` to every member of `room` (or every peer when `None`),
    /// skipping the sender. Full queues drop the frame.
    pub async fn route(&self, from: PeerId, room: Option<&str>, text: &str) -> Dispatch {
        let registry = self.registry.read().await;
        let targets: Vec<PeerId> = match room {
            Some(room) => registry
                .rooms
                .get(room)
                .map(|members| members.iter().copied().filter(|&p| p != from).collect())
                .unwrap_or_default(),
            None => registry.peers.keys().copied().filter(|&p| p != from).collect(),
        };

        let (mut delivered, mut dropped) = (0, 0);
        for peer in targets {
            let Some(sender) = registry.peers.get(&peer) else {
                continue;
            };
            match sender.try_send(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::warn!("Peer {} is too slow, dropping frame", peer);
                }
                Err(TrySendError::Closed(_)) => dropped += 1,
            }
        }
        Dispatch::Routed { delivered, dropped }
    }

    pub async fn peer_count(&self) -> usize {
        self.registry.read().await.peers.len()
    }

    pub async fn room_size(&self, room: &Room) -> usize {
        self.registry
            .read()
            .await
            .rooms
            .get(room.as_str())
            .map_or(0, HashSet::len)
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}
