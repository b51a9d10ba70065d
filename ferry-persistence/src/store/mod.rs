//! Durable per-peer backlog of persisted messages.

pub mod file;
pub mod memory;

use crate::error::Result;
use chrono::{DateTime, Utc};
use ferry::{MessageId, PeerId, TransportMessage};
use serde::{Deserialize, Serialize};

pub use file::FileMessageStore;
pub use memory::InMemoryMessageStore;

/// One backlog entry for one target peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub message: TransportMessage,
    pub is_acked: bool,
    pub stored_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(peer_id: PeerId, message: TransportMessage) -> Self {
        Self {
            peer_id,
            message_id: message.id,
            message,
            is_acked: false,
            stored_at: Utc::now(),
        }
    }
}

/// Lazy, ordered read of a peer's unacknowledged backlog.
pub type MessageCursor = Box<dyn Iterator<Item = Result<StoredMessage>> + Send>;

pub trait MessageStore: Send + Sync {
    fn append(&self, peer_id: &PeerId, message: &TransportMessage) -> Result<()>;

    /// Unknown ids are ignored.
    fn mark_acked(&self, peer_id: &PeerId, message_id: MessageId) -> Result<()>;

    /// Unacknowledged messages in arrival order.
    fn read_unacked_ordered(&self, peer_id: &PeerId) -> Result<MessageCursor>;

    fn delete_all_for_peer(&self, peer_id: &PeerId) -> Result<()>;

    /// Remove acknowledged entries stored before `cutoff`; returns how many.
    fn purge_acknowledged_before(&self, peer_id: &PeerId, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Returns once every append issued for `peer_id` before the call is
    /// visible to readers.
    fn flush(&self, _peer_id: &PeerId) -> Result<()> {
        Ok(())
    }

    fn peer_ids(&self) -> Vec<PeerId>;
}
