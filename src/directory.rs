//! Peer directory collaborator: who is up, who is persistent, and which peer
//! currently runs the persistence service.

use crate::types::{Peer, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdateAction {
    Started,
    Updated,
    Stopped,
    Decommissioned,
}

pub type PeerUpdateListener = Arc<dyn Fn(&PeerId, PeerUpdateAction) + Send + Sync>;

pub trait PeerDirectory: Send + Sync {
    /// Peers running the persistence service, preferred first.
    fn persistence_peers(&self) -> Vec<Peer>;

    fn peers(&self) -> Vec<Peer>;

    fn get_peer(&self, peer_id: &PeerId) -> Option<Peer>;

    fn is_persistent(&self, peer_id: &PeerId) -> bool;

    fn subscribe(&self, listener: PeerUpdateListener);
}

struct PeerEntry {
    peer: Peer,
    is_persistent: bool,
    is_persistence_service: bool,
}

/// Directory backed by a local table. Used by tests and single-process setups.
#[derive(Default)]
pub struct InMemoryPeerDirectory {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    // Preserves registration order for `persistence_peers`.
    order: RwLock<Vec<PeerId>>,
    listeners: RwLock<Vec<PeerUpdateListener>>,
}

impl InMemoryPeerDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_peer(&self, peer: Peer, is_persistent: bool) {
        self.insert(peer, is_persistent, false);
    }

    pub fn add_persistence_peer(&self, peer: Peer) {
        self.insert(peer, false, true);
    }

    fn insert(&self, peer: Peer, is_persistent: bool, is_persistence_service: bool) {
        let peer_id = peer.id.clone();
        let previous = self.peers.write().insert(
            peer_id.clone(),
            PeerEntry {
                peer,
                is_persistent,
                is_persistence_service,
            },
        );
        if previous.is_none() {
            self.order.write().push(peer_id);
        }
    }

    /// Mark a peer up or down and notify subscribers.
    pub fn set_peer_up(&self, peer_id: &PeerId, is_up: bool) {
        let changed = {
            let mut peers = self.peers.write();
            match peers.get_mut(peer_id) {
                Some(entry) => {
                    entry.peer.is_up = is_up;
                    entry.peer.is_responding = is_up;
                    true
                }
                None => false,
            }
        };

        if !changed {
            tracing::warn!("[DIRECTORY] unknown peer {}, ignoring state change", peer_id);
            return;
        }

        let action = if is_up {
            PeerUpdateAction::Started
        } else {
            PeerUpdateAction::Stopped
        };
        self.notify(peer_id, action);
    }

    pub fn decommission(&self, peer_id: &PeerId) {
        let removed = self.peers.write().remove(peer_id).is_some();
        if removed {
            self.order.write().retain(|id| id != peer_id);
            self.notify(peer_id, PeerUpdateAction::Decommissioned);
        }
    }

    fn notify(&self, peer_id: &PeerId, action: PeerUpdateAction) {
        // Clone out so listeners may call back into the directory.
        let listeners: Vec<PeerUpdateListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(peer_id, action);
        }
    }
}

impl PeerDirectory for InMemoryPeerDirectory {
    fn persistence_peers(&self) -> Vec<Peer> {
        let peers = self.peers.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| peers.get(id))
            .filter(|entry| entry.is_persistence_service)
            .map(|entry| entry.peer.clone())
            .collect()
    }

    fn peers(&self) -> Vec<Peer> {
        let peers = self.peers.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| peers.get(id))
            .map(|entry| entry.peer.clone())
            .collect()
    }

    fn get_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.read().get(peer_id).map(|entry| entry.peer.clone())
    }

    fn is_persistent(&self, peer_id: &PeerId) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .map(|entry| entry.is_persistent)
            .unwrap_or(false)
    }

    fn subscribe(&self, listener: PeerUpdateListener) {
        self.listeners.write().push(listener);
    }
}
