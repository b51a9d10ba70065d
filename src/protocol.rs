//! Messages exchanged between replay clients and the persistence service.
//!
//! None of these are persistent themselves. Phase markers and the stopping
//! notification are infrastructure messages so they are dispatched ahead of
//! any queued ordinary traffic.

use crate::types::{Message, MessageId, PeerId, ReplaySessionId, TransportMessage};
use serde::{Deserialize, Serialize};

/// Client -> persistence peer, once per registration when persistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub session_id: ReplaySessionId,
}

impl Message for ReplayRequest {
    const TYPE_NAME: &'static str = "Ferry.Persistence.ReplayRequest";
    const IS_PERSISTENT: bool = false;
}

/// Session -> client, one per backlog item or buffered live item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayedMessage {
    pub session_id: ReplaySessionId,
    pub message: TransportMessage,
}

impl Message for ReplayedMessage {
    const TYPE_NAME: &'static str = "Ferry.Persistence.ReplayedMessage";
    const IS_PERSISTENT: bool = false;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayPhaseEnded {
    pub session_id: ReplaySessionId,
}

impl Message for ReplayPhaseEnded {
    const TYPE_NAME: &'static str = "Ferry.Persistence.ReplayPhaseEnded";
    const IS_PERSISTENT: bool = false;
    const IS_INFRASTRUCTURE: bool = true;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyPhaseEnded {
    pub session_id: ReplaySessionId,
}

impl Message for SafetyPhaseEnded {
    const TYPE_NAME: &'static str = "Ferry.Persistence.SafetyPhaseEnded";
    const IS_PERSISTENT: bool = false;
    const IS_INFRASTRUCTURE: bool = true;
}

/// Client -> persistence peer. Names every persistent target, including
/// targets that are currently down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistRequest {
    pub message: TransportMessage,
    pub persistent_peer_ids: Vec<PeerId>,
}

impl Message for PersistRequest {
    const TYPE_NAME: &'static str = "Ferry.Persistence.PersistRequest";
    const IS_PERSISTENT: bool = false;
}

/// Client -> persistence peer, after the message was handled locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHandledAck {
    pub message_id: MessageId,
}

impl Message for MessageHandledAck {
    const TYPE_NAME: &'static str = "Ferry.Persistence.MessageHandledAck";
    const IS_PERSISTENT: bool = false;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceStopping;

impl Message for PersistenceStopping {
    const TYPE_NAME: &'static str = "Ferry.Persistence.PersistenceStopping";
    const IS_PERSISTENT: bool = false;
    const IS_INFRASTRUCTURE: bool = true;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceStoppingAck;

impl Message for PersistenceStoppingAck {
    const TYPE_NAME: &'static str = "Ferry.Persistence.PersistenceStoppingAck";
    const IS_PERSISTENT: bool = false;
}
