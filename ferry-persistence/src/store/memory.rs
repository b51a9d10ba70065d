use super::{MessageCursor, MessageStore, StoredMessage};
use crate::error::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ferry::{MessageId, PeerId, TransportMessage};

#[derive(Default)]
pub struct InMemoryMessageStore {
    backlogs: DashMap<PeerId, Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry for a peer, acknowledged or not.
    pub fn entries(&self, peer_id: &PeerId) -> Vec<StoredMessage> {
        self.backlogs
            .get(peer_id)
            .map(|backlog| backlog.clone())
            .unwrap_or_default()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn append(&self, peer_id: &PeerId, message: &TransportMessage) -> Result<()> {
        self.backlogs
            .entry(peer_id.clone())
            .or_default()
            .push(StoredMessage::new(peer_id.clone(), message.clone()));
        Ok(())
    }

    fn mark_acked(&self, peer_id: &PeerId, message_id: MessageId) -> Result<()> {
        if let Some(mut backlog) = self.backlogs.get_mut(peer_id) {
            for entry in backlog.iter_mut().filter(|e| e.message_id == message_id) {
                entry.is_acked = true;
            }
        }
        Ok(())
    }

    fn read_unacked_ordered(&self, peer_id: &PeerId) -> Result<MessageCursor> {
        // Snapshot so the cursor holds no shard lock while the session awaits.
        let unacked: Vec<StoredMessage> = self
            .backlogs
            .get(peer_id)
            .map(|backlog| backlog.iter().filter(|e| !e.is_acked).cloned().collect())
            .unwrap_or_default();
        Ok(Box::new(unacked.into_iter().map(Ok)))
    }

    fn delete_all_for_peer(&self, peer_id: &PeerId) -> Result<()> {
        self.backlogs.remove(peer_id);
        Ok(())
    }

    fn purge_acknowledged_before(&self, peer_id: &PeerId, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(mut backlog) = self.backlogs.get_mut(peer_id) else {
            return Ok(0);
        };
        let before = backlog.len();
        backlog.retain(|e| !(e.is_acked && e.stored_at < cutoff));
        Ok(before - backlog.len())
    }

    fn peer_ids(&self) -> Vec<PeerId> {
        self.backlogs.iter().map(|entry| entry.key().clone()).collect()
    }
}
