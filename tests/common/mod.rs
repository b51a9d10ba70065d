#![allow(dead_code)]

use async_trait::async_trait;
use ferry::directory::InMemoryPeerDirectory;
use ferry::{
    ClientConfig, Message, MessageId, MessageReceivedHandler, OriginatorInfo, Peer, PeerDirectory,
    PeerId, PeerUpdateAction, ReceiveQueue, ReplayClient, Transport, TransportMessage,
};
use ferry_persistence::{MessageStore, PersistenceConfig, PersistenceService};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u32,
}

impl Message for OrderPlaced {
    const TYPE_NAME: &'static str = "Test.OrderPlaced";
}

/// Routes messages between transports by endpoint. Each started transport
/// has an inbox drained by its own task, so delivery is asynchronous and
/// ordered per receiver.
#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<TransportMessage>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, peer: &Peer) -> Arc<NetworkTransport> {
        Arc::new(NetworkTransport {
            network: Arc::clone(self),
            peer_id: RwLock::new(peer.id.clone()),
            endpoint: peer.endpoint.clone(),
            handler: Arc::new(RwLock::new(None)),
            pump: Mutex::new(None),
        })
    }

    fn deliver(&self, endpoint: &str, message: TransportMessage) {
        let inboxes = self.inboxes.lock();
        match inboxes.get(endpoint) {
            Some(inbox) => {
                let _ = inbox.send(message);
            }
            None => tracing::debug!(
                "[NET] {} unreachable, dropping {}",
                endpoint,
                message.message_type_id
            ),
        }
    }
}

pub struct NetworkTransport {
    network: Arc<MemoryNetwork>,
    peer_id: RwLock<PeerId>,
    endpoint: String,
    handler: Arc<RwLock<Option<MessageReceivedHandler>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for NetworkTransport {
    fn configure(&self, peer_id: PeerId, _environment: Option<String>) {
        *self.peer_id.write() = peer_id;
    }

    fn peer_id(&self) -> PeerId {
        self.peer_id.read().clone()
    }

    fn inbound_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn set_message_received(&self, handler: MessageReceivedHandler) {
        *self.handler.write() = Some(handler);
    }

    async fn start(&self) -> ferry::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
        self.network
            .inboxes
            .lock()
            .insert(self.endpoint.clone(), tx);

        let handler = Arc::clone(&self.handler);
        let pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let current = handler.read().clone();
                if let Some(current) = current {
                    current(message);
                }
            }
        });
        *self.pump.lock() = Some(pump);
        Ok(())
    }

    async fn stop(&self) -> ferry::Result<()> {
        self.network.inboxes.lock().remove(&self.endpoint);
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        Ok(())
    }

    fn send(&self, message: TransportMessage, peers: Vec<Peer>) -> ferry::Result<()> {
        for peer in peers {
            self.network.deliver(&peer.endpoint, message.clone());
        }
        Ok(())
    }

    fn on_peer_updated(&self, _peer_id: &PeerId, _action: PeerUpdateAction) {}
}

pub fn persistence_peer() -> Peer {
    Peer::new("Ferry.Persistence.0", "mem://persistence")
}

/// Directory holding the persistence peer, up.
pub fn directory() -> Arc<InMemoryPeerDirectory> {
    let directory = InMemoryPeerDirectory::new();
    directory.add_persistence_peer(persistence_peer());
    directory
}

pub fn fast_config() -> PersistenceConfig {
    PersistenceConfig {
        safety_phase_duration_ms: 200,
        persistence_stopping_timeout_ms: 2_000,
        ..PersistenceConfig::default()
    }
}

pub async fn start_persistence(
    network: &Arc<MemoryNetwork>,
    directory: &Arc<InMemoryPeerDirectory>,
    store: Arc<dyn MessageStore>,
    config: PersistenceConfig,
) -> Arc<PersistenceService> {
    let service = PersistenceService::new(
        network.transport(&persistence_peer()),
        directory.clone(),
        store,
        config,
    );
    service.start().await.unwrap();
    service
}

/// A bus peer: network, then the replay client, then the receive queue the
/// application talks to. The application handler records what it sees and
/// acks it.
pub struct ClientNode {
    pub peer: Peer,
    pub client: Arc<ReplayClient>,
    pub bus: Arc<ReceiveQueue>,
    pub received: Arc<Mutex<Vec<MessageId>>>,
}

impl ClientNode {
    pub async fn start(
        network: &Arc<MemoryNetwork>,
        directory: &Arc<InMemoryPeerDirectory>,
        peer: Peer,
        config: ClientConfig,
    ) -> Self {
        let node = Self::create(network, directory, peer, config);
        node.bus.start().await.unwrap();
        node.bus.on_registered().unwrap();
        node
    }

    pub fn create(
        network: &Arc<MemoryNetwork>,
        directory: &Arc<InMemoryPeerDirectory>,
        peer: Peer,
        config: ClientConfig,
    ) -> Self {
        let stop_timeout = config.receive_stop_timeout();
        let client = ReplayClient::new(network.transport(&peer), directory.clone(), config);
        let bus = Arc::new(ReceiveQueue::new(client.clone(), stop_timeout));
        let received = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&bus);
        let captured = Arc::clone(&received);
        bus.set_message_received(Arc::new(move |message: TransportMessage| {
            captured.lock().push(message.id);
            if let Some(bus) = weak.upgrade() {
                bus.ack_message(&message).unwrap();
            }
        }));

        let weak = Arc::downgrade(&bus);
        directory.subscribe(Arc::new(move |peer_id: &PeerId, action: PeerUpdateAction| {
            if let Some(bus) = weak.upgrade() {
                bus.on_peer_updated(peer_id, action);
            }
        }));

        Self {
            peer,
            client,
            bus,
            received,
        }
    }

    pub fn received(&self) -> Vec<MessageId> {
        self.received.lock().clone()
    }

    /// Publish `message` to `targets`, resolved through the directory.
    pub fn publish(
        &self,
        directory: &Arc<InMemoryPeerDirectory>,
        message: &OrderPlaced,
        targets: &[&Peer],
    ) -> TransportMessage {
        let transport_message = TransportMessage::new(
            message,
            OriginatorInfo::new(self.peer.id.clone(), self.peer.endpoint.clone()),
        )
        .unwrap();
        let peers = targets
            .iter()
            .map(|peer| directory.get_peer(&peer.id).unwrap())
            .collect();
        self.bus.send(transport_message.clone(), peers).unwrap();
        transport_message
    }
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn unacked_ids(store: &dyn MessageStore, peer_id: &PeerId) -> Vec<MessageId> {
    store
        .read_unacked_ordered(peer_id)
        .unwrap()
        .map(|entry| entry.unwrap().message_id)
        .collect()
}

pub fn init() {
    ferry::init_tracing();
}
