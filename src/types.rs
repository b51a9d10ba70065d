use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bus peer identifier, e.g. `"Ferry.Persistence.0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

/// Unique id of a published message. Preserved through persistence and replay,
/// which is what makes safety-window deduplication possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id minted once per replay request. Every protocol message of one replay
/// attempt carries it so stale sessions can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplaySessionId(Uuid);

impl ReplaySessionId {
    pub fn new() -> Self {
        ReplaySessionId(Uuid::new_v4())
    }
}

impl Default for ReplaySessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplaySessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message type descriptor carried with every transport message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageTypeId {
    pub full_name: String,
    /// Delivery must survive target downtime (durably queued until acked).
    pub is_persistent: bool,
    /// Protocol-control type that bypasses ordered receive queuing.
    pub is_infrastructure: bool,
}

impl MessageTypeId {
    pub fn of<M: Message>() -> Self {
        MessageTypeId {
            full_name: M::TYPE_NAME.to_string(),
            is_persistent: M::IS_PERSISTENT,
            is_infrastructure: M::IS_INFRASTRUCTURE,
        }
    }

    pub fn is<M: Message>(&self) -> bool {
        self.full_name == M::TYPE_NAME
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// A message type that can travel on the bus.
///
/// Types are persistent by default; protocol types override the flags.
pub trait Message: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
    const IS_PERSISTENT: bool = true;
    const IS_INFRASTRUCTURE: bool = false;
}

/// A known bus peer as seen by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub endpoint: String,
    pub is_up: bool,
    pub is_responding: bool,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, endpoint: impl Into<String>) -> Self {
        Peer {
            id: id.into(),
            endpoint: endpoint.into(),
            is_up: true,
            is_responding: true,
        }
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginatorInfo {
    pub sender_id: PeerId,
    pub sender_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_machine_name: Option<String>,
}

impl OriginatorInfo {
    pub fn new(sender_id: PeerId, sender_endpoint: impl Into<String>) -> Self {
        OriginatorInfo {
            sender_id,
            sender_endpoint: sender_endpoint.into(),
            sender_machine_name: hostname::get().ok().and_then(|h| h.into_string().ok()),
        }
    }
}

/// Envelope for every message exchanged between peers.
///
/// `content` is the serde_json encoding of the typed message; the byte-level
/// wire format of the envelope itself belongs to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: MessageId,
    pub message_type_id: MessageTypeId,
    pub content: Vec<u8>,
    pub originator: OriginatorInfo,
    pub created_at: DateTime<Utc>,
}

impl TransportMessage {
    /// Wrap a typed message with a fresh message id.
    pub fn new<M: Message>(message: &M, originator: OriginatorInfo) -> crate::error::Result<Self> {
        Ok(TransportMessage {
            id: MessageId::new(),
            message_type_id: MessageTypeId::of::<M>(),
            content: serde_json::to_vec(message)?,
            originator,
            created_at: Utc::now(),
        })
    }

    pub fn is<M: Message>(&self) -> bool {
        self.message_type_id.is::<M>()
    }

    /// Decode the typed message, checking the type name first.
    pub fn decode<M: Message>(&self) -> crate::error::Result<M> {
        if !self.is::<M>() {
            return Err(crate::error::FerryError::UnexpectedMessageType {
                expected: M::TYPE_NAME.to_string(),
                actual: self.message_type_id.full_name.clone(),
            });
        }
        Ok(serde_json::from_slice(&self.content)?)
    }

    /// The sending peer, addressable for replies.
    pub fn sender(&self) -> Peer {
        Peer::new(
            self.originator.sender_id.clone(),
            self.originator.sender_endpoint.clone(),
        )
    }

    pub fn is_persistent(&self) -> bool {
        self.message_type_id.is_persistent
    }

    pub fn is_infrastructure(&self) -> bool {
        self.message_type_id.is_infrastructure
    }
}
