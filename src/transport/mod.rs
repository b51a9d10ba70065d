pub mod receive_queue;
pub mod testing;

use crate::directory::PeerUpdateAction;
use crate::error::Result;
use crate::types::{OriginatorInfo, Peer, PeerId, TransportMessage};
use async_trait::async_trait;
use std::sync::Arc;

pub use receive_queue::ReceiveQueue;

/// Inbound callback installed on a transport.
pub type MessageReceivedHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// Point-to-point message transport between bus peers.
///
/// Decorators (receive queue, replay client) implement this trait by wrapping
/// another transport and passing through what they do not change.
#[async_trait]
pub trait Transport: Send + Sync {
    fn configure(&self, peer_id: PeerId, environment: Option<String>);

    fn peer_id(&self) -> PeerId;

    fn inbound_endpoint(&self) -> String;

    fn set_message_received(&self, handler: MessageReceivedHandler);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn send(&self, message: TransportMessage, peers: Vec<Peer>) -> Result<()>;

    fn on_peer_updated(&self, peer_id: &PeerId, action: PeerUpdateAction);

    /// Called once the peer is registered in the directory.
    fn on_registered(&self) -> Result<()> {
        Ok(())
    }

    /// Called by the dispatcher once an inbound message was fully processed.
    fn ack_message(&self, _message: &TransportMessage) -> Result<()> {
        Ok(())
    }

    fn originator(&self) -> OriginatorInfo {
        OriginatorInfo::new(self.peer_id(), self.inbound_endpoint())
    }
}
