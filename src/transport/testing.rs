//! In-process transport that records what it is asked to do.
//!
//! Used by the unit tests of this crate and of `ferry-persistence`.

use super::{MessageReceivedHandler, Transport};
use crate::directory::PeerUpdateAction;
use crate::error::{FerryError, Result};
use crate::types::{Message, MessageId, Peer, PeerId, TransportMessage};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: TransportMessage,
    pub targets: Vec<Peer>,
}

/// Called after a send is recorded; may raise inbound messages inline.
pub type SendHook = Arc<dyn Fn(&TransportMessage, &[Peer]) + Send + Sync>;

pub struct TestTransport {
    peer_id: RwLock<PeerId>,
    endpoint: String,
    environment: RwLock<Option<String>>,
    handler: RwLock<Option<MessageReceivedHandler>>,
    sent: Mutex<Vec<SentMessage>>,
    peer_updates: Mutex<Vec<(PeerId, PeerUpdateAction)>>,
    acked: Mutex<Vec<MessageId>>,
    registered_count: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_delay: Mutex<Option<Duration>>,
    fail_sends: AtomicBool,
    send_hook: RwLock<Option<SendHook>>,
}

impl TestTransport {
    pub fn new(peer_id: impl Into<PeerId>, endpoint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            peer_id: RwLock::new(peer_id.into()),
            endpoint: endpoint.into(),
            environment: RwLock::new(None),
            handler: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            peer_updates: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            registered_count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_delay: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            send_hook: RwLock::new(None),
        })
    }

    /// Simulate a message arriving from the network.
    pub fn raise_message_received(&self, message: TransportMessage) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::warn!(
                "[TEST {}] no handler installed, dropping {}",
                self.peer_id(),
                message.message_type_id
            ),
        }
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Sent messages of type `M`, decoded, with their targets.
    pub fn sent_messages_of<M: Message>(&self) -> Vec<(M, Vec<Peer>)> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.message.is::<M>())
            .filter_map(|sent| {
                sent.message
                    .decode::<M>()
                    .ok()
                    .map(|decoded| (decoded, sent.targets.clone()))
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn peer_updates(&self) -> Vec<(PeerId, PeerUpdateAction)> {
        self.peer_updates.lock().clone()
    }

    pub fn acked_messages(&self) -> Vec<MessageId> {
        self.acked.lock().clone()
    }

    pub fn registered_count(&self) -> usize {
        self.registered_count.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn environment(&self) -> Option<String> {
        self.environment.read().clone()
    }

    /// Make `stop` take this long, to exercise shutdown timeouts.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = Some(delay);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_send_hook(&self, hook: SendHook) {
        *self.send_hook.write() = Some(hook);
    }
}

#[async_trait]
impl Transport for TestTransport {
    fn configure(&self, peer_id: PeerId, environment: Option<String>) {
        *self.peer_id.write() = peer_id;
        *self.environment.write() = environment;
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

    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, message: TransportMessage, peers: Vec<Peer>) -> Result<()> {
        if self.is_stopped() {
            return Err(FerryError::TransportStopped);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(FerryError::Transport(format!(
                "send of {} refused by test transport",
                message.message_type_id
            )));
        }
        self.sent.lock().push(SentMessage {
            message: message.clone(),
            targets: peers.clone(),
        });
        let hook = self.send_hook.read().clone();
        if let Some(hook) = hook {
            hook(&message, &peers);
        }
        Ok(())
    }

    fn on_peer_updated(&self, peer_id: &PeerId, action: PeerUpdateAction) {
        self.peer_updates.lock().push((peer_id.clone(), action));
    }

    fn on_registered(&self) -> Result<()> {
        self.registered_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ack_message(&self, message: &TransportMessage) -> Result<()> {
        self.acked.lock().push(message.id);
        Ok(())
    }
}
