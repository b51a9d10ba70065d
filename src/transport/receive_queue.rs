//! Receive queue decorator: decouples socket arrival from handler execution.
//!
//! Ordinary messages go through an unbounded FIFO drained by one worker task,
//! one handler call at a time. Infrastructure messages skip the queue and are
//! dispatched inline on the arrival path, so phase markers and shutdown
//! handshakes are never stuck behind a slow handler.

use super::{MessageReceivedHandler, Transport};
use crate::directory::PeerUpdateAction;
use crate::error::Result;
use crate::types::{Peer, PeerId, TransportMessage};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type HandlerSlot = Arc<RwLock<Option<MessageReceivedHandler>>>;
type SenderSlot = Arc<Mutex<Option<mpsc::UnboundedSender<TransportMessage>>>>;

pub struct ReceiveQueue {
    inner: Arc<dyn Transport>,
    stop_timeout: Duration,
    handler: HandlerSlot,
    sender: SenderSlot,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl ReceiveQueue {
    pub fn new(inner: Arc<dyn Transport>, stop_timeout: Duration) -> Self {
        Self {
            inner,
            stop_timeout,
            handler: Arc::new(RwLock::new(None)),
            sender: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages queued or being handled by the worker.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn install_inbound_handler(&self) {
        let peer_id = self.inner.peer_id();
        let handler = self.handler.clone();
        let sender = self.sender.clone();
        let pending = self.pending.clone();

        self.inner
            .set_message_received(Arc::new(move |message: TransportMessage| {
                if message.is_infrastructure() {
                    dispatch(&peer_id, &handler, message);
                    return;
                }

                let sender = sender.lock();
                match sender.as_ref() {
                    Some(tx) => {
                        pending.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = tx.send(message) {
                            pending.fetch_sub(1, Ordering::SeqCst);
                            tracing::warn!(
                                "[RQ {}] worker gone, dropping {}",
                                peer_id,
                                e.0.message_type_id
                            );
                        }
                    }
                    None => {
                        tracing::warn!(
                            "[RQ {}] queue not running, dropping {}",
                            peer_id,
                            message.message_type_id
                        );
                    }
                }
            }));
    }
}

fn dispatch(peer_id: &PeerId, handler: &HandlerSlot, message: TransportMessage) {
    let handler = handler.read().clone();
    let Some(handler) = handler else {
        tracing::warn!(
            "[RQ {}] no receive handler, dropping {}",
            peer_id,
            message.message_type_id
        );
        return;
    };

    let message_type = message.message_type_id.full_name.clone();
    let message_id = message.id;
    if let Err(panic_info) =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(message)))
    {
        let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = panic_info.downcast_ref::<&str>() {
            s.to_string()
        } else {
            "unknown panic in receive handler".to_string()
        };
        tracing::error!(
            "[RQ {}] PANIC while handling {} {}: {}",
            peer_id,
            message_type,
            message_id,
            msg
        );
    }
}

async fn process_messages(
    peer_id: PeerId,
    mut rx: mpsc::UnboundedReceiver<TransportMessage>,
    handler: HandlerSlot,
    pending: Arc<AtomicUsize>,
) {
    tracing::debug!("[RQ {}] worker started", peer_id);
    while let Some(message) = rx.recv().await {
        dispatch(&peer_id, &handler, message);
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("[RQ {}] worker drained, exiting", peer_id);
}

#[async_trait]
impl Transport for ReceiveQueue {
    fn configure(&self, peer_id: PeerId, environment: Option<String>) {
        self.inner.configure(peer_id, environment);
    }

    fn peer_id(&self) -> PeerId {
        self.inner.peer_id()
    }

    fn inbound_endpoint(&self) -> String {
        self.inner.inbound_endpoint()
    }

    fn set_message_received(&self, handler: MessageReceivedHandler) {
        *self.handler.write() = Some(handler);
    }

    async fn start(&self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);

        let worker = tokio::spawn(process_messages(
            self.inner.peer_id(),
            rx,
            self.handler.clone(),
            self.pending.clone(),
        ));
        if let Some(previous) = self.worker.lock().replace(worker) {
            tracing::warn!("[RQ {}] restarted while running", self.inner.peer_id());
            previous.abort();
        }

        self.install_inbound_handler();
        self.inner.start().await
    }

    async fn stop(&self) -> Result<()> {
        let peer_id = self.inner.peer_id();

        let stop_result = match tokio::time::timeout(self.stop_timeout, self.inner.stop()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "[RQ {}] transport stop did not complete within {}ms, proceeding",
                    peer_id,
                    self.stop_timeout.as_millis()
                );
                Ok(())
            }
        };

        // Closing the channel lets the worker drain what is left and exit.
        drop(self.sender.lock().take());

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("[RQ {}] worker task failed: {:?}", peer_id, e);
            }
        }

        stop_result
    }

    fn send(&self, message: TransportMessage, peers: Vec<Peer>) -> Result<()> {
        self.inner.send(message, peers)
    }

    fn on_peer_updated(&self, peer_id: &PeerId, action: PeerUpdateAction) {
        self.inner.on_peer_updated(peer_id, action);
    }

    fn on_registered(&self) -> Result<()> {
        self.inner.on_registered()
    }

    fn ack_message(&self, message: &TransportMessage) -> Result<()> {
        self.inner.ack_message(message)
    }
}
