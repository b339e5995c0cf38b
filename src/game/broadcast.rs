//! Peers connected to a match and fan-out delivery

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ws::protocol::ServerPacket;

/// Outbound frames a slow connection may have queued before frames are dropped
pub const PEER_QUEUE_CAPACITY: usize = 256;

pub type PeerId = Uuid;

/// Message delivered to a connection's writer task
#[derive(Debug)]
pub enum PeerMessage {
    /// Frame to send, stamped with the connection's own sequence on the way out
    Packet(Arc<ServerPacket>),
    /// Close the socket
    Close,
}

/// Sending half of a connection
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    tx: mpsc::Sender<PeerMessage>,
}

impl Peer {
    pub fn new(id: PeerId, tx: mpsc::Sender<PeerMessage>) -> Self {
        Self { id, tx }
    }

    /// A fresh peer with its own bounded queue
    pub fn channel() -> (Self, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        (Self::new(Uuid::new_v4(), tx), rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Queue a packet without waiting; a full or closed queue drops it
    pub fn send(&self, packet: Arc<ServerPacket>) -> bool {
        match self.tx.try_send(PeerMessage::Packet(packet)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer_id = %self.id, "Peer queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer_id = %self.id, "Peer gone, dropping frame");
                false
            }
        }
    }

    pub fn close(&self) {
        let _ = self.tx.try_send(PeerMessage::Close);
    }
}

/// The peers attached to one match
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: Vec<Peer>,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer unless it is already a member
    pub fn add(&mut self, peer: Peer) {
        if !self.contains(peer.id()) {
            self.peers.push(peer);
        }
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.id() == id)?;
        Some(self.peers.swap_remove(index))
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.iter().any(|p| p.id() == id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send to every member, skipping `except`
    pub fn send(&self, packet: ServerPacket, except: Option<PeerId>) {
        let packet = Arc::new(packet);
        for peer in &self.peers {
            if Some(peer.id()) != except {
                peer.send(packet.clone());
            }
        }
    }

    /// Ask every member's writer to close its socket
    pub fn close_all(&self) {
        for peer in &self.peers {
            peer.close();
        }
    }
}
