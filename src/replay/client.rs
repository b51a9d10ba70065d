//! Consumer-side replay decorator.
//!
//! Wraps the peer's network transport, asks the persistence peer for a replay
//! on registration and filters inbound traffic according to the replay phase
//! as it arrives. Anything queued above this decorator has already been
//! filtered, so a phase change cannot let a queued duplicate through.
//! On the outbound side it mirrors persistent traffic to the persistence peer
//! and acknowledges handled messages, queueing both while the persistence
//! peer is known to be down.
//!
//! The state lock is never held across a send on the inner transport.

use super::phase::{ReplayPhase, ReplayPhaseKind};
use crate::config::ClientConfig;
use crate::directory::{PeerDirectory, PeerUpdateAction};
use crate::error::{FerryError, Result};
use crate::protocol::{
    MessageHandledAck, PersistRequest, PersistenceStopping, PersistenceStoppingAck,
    ReplayPhaseEnded, ReplayRequest, ReplayedMessage, SafetyPhaseEnded,
};
use crate::transport::{MessageReceivedHandler, Transport};
use crate::types::{Message, Peer, PeerId, ReplaySessionId, TransportMessage};
use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

struct ClientState {
    phase: ReplayPhase,
    persistence_peer: Option<Peer>,
    persistence_up: bool,
    /// Persistence-bound messages held while the persistence peer is down.
    persist_queue: VecDeque<TransportMessage>,
}

pub struct ReplayClient {
    inner: Arc<dyn Transport>,
    directory: Arc<dyn PeerDirectory>,
    config: ClientConfig,
    state: Mutex<ClientState>,
    /// Serializes sends to the persistence peer so a flush and a direct
    /// send cannot interleave.
    persist_order: ReentrantMutex<()>,
    handler: RwLock<Option<MessageReceivedHandler>>,
}

impl ReplayClient {
    pub fn new(
        inner: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            inner,
            directory,
            config,
            state: Mutex::new(ClientState {
                phase: ReplayPhase::Idle,
                persistence_peer: None,
                persistence_up: false,
                persist_queue: VecDeque::new(),
            }),
            persist_order: ReentrantMutex::new(()),
            handler: RwLock::new(None),
        });

        let weak = Arc::downgrade(&client);
        client
            .inner
            .set_message_received(Arc::new(move |message: TransportMessage| {
                if let Some(client) = weak.upgrade() {
                    client.on_message_received(message);
                }
            }));

        client
    }

    pub fn phase(&self) -> ReplayPhaseKind {
        self.state.lock().phase.kind()
    }

    pub fn session_id(&self) -> Option<ReplaySessionId> {
        self.state.lock().phase.session_id()
    }

    pub fn persistence_peer(&self) -> Option<Peer> {
        self.state.lock().persistence_peer.clone()
    }

    pub fn is_persistence_up(&self) -> bool {
        self.state.lock().persistence_up
    }

    pub fn queued_persistence_messages(&self) -> usize {
        self.state.lock().persist_queue.len()
    }

    fn on_message_received(&self, message: TransportMessage) {
        if message.is::<ReplayedMessage>() {
            match message.decode::<ReplayedMessage>() {
                Ok(replayed) => self.on_replayed_message(replayed),
                Err(e) => tracing::warn!(
                    "[CLIENT {}] undecodable replayed message {}: {}",
                    self.inner.peer_id(),
                    message.id,
                    e
                ),
            }
            return;
        }

        if message.is::<ReplayPhaseEnded>() {
            match message.decode::<ReplayPhaseEnded>() {
                Ok(marker) => self.on_replay_phase_ended(marker.session_id),
                Err(e) => tracing::warn!(
                    "[CLIENT {}] undecodable replay phase marker: {}",
                    self.inner.peer_id(),
                    e
                ),
            }
            return;
        }

        if message.is::<SafetyPhaseEnded>() {
            match message.decode::<SafetyPhaseEnded>() {
                Ok(marker) => self.on_safety_phase_ended(marker.session_id),
                Err(e) => tracing::warn!(
                    "[CLIENT {}] undecodable safety phase marker: {}",
                    self.inner.peer_id(),
                    e
                ),
            }
            return;
        }

        if message.is::<PersistenceStopping>() {
            self.on_persistence_stopping(&message);
            return;
        }

        let forwarded = self.state.lock().phase.on_live_message(message);
        if let Some(message) = forwarded {
            self.forward(message);
        }
    }

    fn on_replayed_message(&self, replayed: ReplayedMessage) {
        let message_id = replayed.message.id;
        let forwarded = self
            .state
            .lock()
            .phase
            .on_replayed_message(replayed.session_id, replayed.message);

        match forwarded {
            Some(message) => self.forward(message),
            None => tracing::debug!(
                "[CLIENT {}] dropped replayed {} (session {})",
                self.inner.peer_id(),
                message_id,
                replayed.session_id
            ),
        }
    }

    fn on_replay_phase_ended(&self, session_id: ReplaySessionId) {
        if self.state.lock().phase.on_replay_phase_ended(session_id) {
            tracing::info!(
                "[CLIENT {}] replay phase ended (session {}), entering safety window",
                self.inner.peer_id(),
                session_id
            );
        } else {
            tracing::debug!(
                "[CLIENT {}] ignoring replay phase marker for session {}",
                self.inner.peer_id(),
                session_id
            );
        }
    }

    fn on_safety_phase_ended(&self, session_id: ReplaySessionId) {
        if self.state.lock().phase.on_safety_phase_ended(session_id) {
            tracing::info!(
                "[CLIENT {}] safety phase ended (session {}), now live",
                self.inner.peer_id(),
                session_id
            );
        } else {
            tracing::debug!(
                "[CLIENT {}] ignoring safety phase marker for session {}",
                self.inner.peer_id(),
                session_id
            );
        }
    }

    fn on_persistence_stopping(&self, message: &TransportMessage) {
        let sender = message.sender();
        tracing::info!(
            "[CLIENT {}] persistence peer {} is stopping",
            self.inner.peer_id(),
            sender.id
        );

        match TransportMessage::new(&PersistenceStoppingAck, self.inner.originator()) {
            Ok(ack) => {
                if let Err(e) = self.inner.send(ack, vec![sender.clone()]) {
                    tracing::warn!(
                        "[CLIENT {}] failed to ack persistence stop to {}: {}",
                        self.inner.peer_id(),
                        sender.id,
                        e
                    );
                }
            }
            Err(e) => tracing::error!(
                "[CLIENT {}] failed to build stopping ack: {}",
                self.inner.peer_id(),
                e
            ),
        }

        let mut state = self.state.lock();
        let is_current = state
            .persistence_peer
            .as_ref()
            .map(|peer| peer.id == sender.id)
            .unwrap_or(true);
        if is_current {
            if state.persistence_peer.is_none() {
                state.persistence_peer = Some(sender);
            }
            state.persistence_up = false;
        }
    }

    fn forward(&self, message: TransportMessage) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::warn!(
                "[CLIENT {}] no receive handler, dropping {}",
                self.inner.peer_id(),
                message.message_type_id
            ),
        }
    }

    /// Send to the persistence peer, or queue while it is down or unknown.
    fn send_to_persistence<M: Message>(&self, message: &M) -> Result<()> {
        let _ordered = self.persist_order.lock();
        let transport_message = TransportMessage::new(message, self.inner.originator())?;

        let peer = {
            let mut state = self.state.lock();
            if matches!(state.phase, ReplayPhase::Idle) {
                tracing::debug!(
                    "[CLIENT {}] not registered, skipping {}",
                    self.inner.peer_id(),
                    M::TYPE_NAME
                );
                return Ok(());
            }
            match state.persistence_peer.clone().filter(|_| state.persistence_up) {
                Some(peer) => peer,
                None => {
                    self.enqueue(&mut state, transport_message, M::TYPE_NAME);
                    return Ok(());
                }
            }
        };

        match self.inner.send(transport_message.clone(), vec![peer.clone()]) {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "[CLIENT {}] persistence peer {} unreachable ({}), queueing",
                    self.inner.peer_id(),
                    peer.id,
                    e
                );
                let mut state = self.state.lock();
                state.persistence_up = false;
                self.enqueue(&mut state, transport_message, M::TYPE_NAME);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue(&self, state: &mut ClientState, message: TransportMessage, type_name: &str) {
        state.persist_queue.push_back(message);
        tracing::debug!(
            "[CLIENT {}] persistence down, queued {} ({} pending)",
            self.inner.peer_id(),
            type_name,
            state.persist_queue.len()
        );
    }

    /// Caller holds `persist_order`.
    fn flush_persist_queue(&self, peer: &Peer) {
        let queued: Vec<TransportMessage> = self.state.lock().persist_queue.drain(..).collect();
        if queued.is_empty() {
            return;
        }

        tracing::info!(
            "[CLIENT {}] persistence peer {} is back, flushing {} queued messages",
            self.inner.peer_id(),
            peer.id,
            queued.len()
        );
        let mut remaining = queued.into_iter();
        while let Some(message) = remaining.next() {
            let message_id = message.id;
            match self.inner.send(message.clone(), vec![peer.clone()]) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    let mut state = self.state.lock();
                    let mut requeued: VecDeque<TransportMessage> =
                        std::iter::once(message).chain(remaining).collect();
                    requeued.extend(state.persist_queue.drain(..));
                    tracing::warn!(
                        "[CLIENT {}] flush to {} interrupted ({}), {} messages queued again",
                        self.inner.peer_id(),
                        peer.id,
                        e,
                        requeued.len()
                    );
                    state.persist_queue = requeued;
                    state.persistence_up = false;
                    return;
                }
                Err(e) => tracing::error!(
                    "[CLIENT {}] failed to flush {} to {}: {}",
                    self.inner.peer_id(),
                    message_id,
                    peer.id,
                    e
                ),
            }
        }
    }
}

#[async_trait]
impl Transport for ReplayClient {
    fn configure(&self, peer_id: PeerId, environment: Option<String>) {
        self.inner
            .configure(peer_id, environment.or_else(|| self.config.environment.clone()));
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
        if !self.config.is_persistent {
            self.state.lock().phase.go_live();
        }
        self.inner.start().await
    }

    async fn stop(&self) -> Result<()> {
        let result = self.inner.stop().await;

        let discarded = {
            let mut state = self.state.lock();
            let count = state.persist_queue.len();
            state.persist_queue.clear();
            count
        };
        if discarded > 0 {
            tracing::warn!(
                "[CLIENT {}] stopping with persistence down, discarded {} queued messages",
                self.inner.peer_id(),
                discarded
            );
        }

        result
    }

    fn send(&self, message: TransportMessage, peers: Vec<Peer>) -> Result<()> {
        let persist_request = if message.is_persistent() {
            let persistent_peer_ids: Vec<PeerId> = peers
                .iter()
                .filter(|peer| self.directory.is_persistent(&peer.id))
                .map(|peer| peer.id.clone())
                .collect();
            (!persistent_peer_ids.is_empty()).then(|| PersistRequest {
                message: message.clone(),
                persistent_peer_ids,
            })
        } else {
            None
        };

        // Persist even when the direct send fails: durable queuing is what
        // covers unreachable targets.
        let send_result = self.inner.send(message, peers);
        if let Some(request) = persist_request {
            self.send_to_persistence(&request)?;
        }
        send_result
    }

    fn on_peer_updated(&self, peer_id: &PeerId, action: PeerUpdateAction) {
        match action {
            PeerUpdateAction::Started | PeerUpdateAction::Updated => {
                let peer = self
                    .directory
                    .persistence_peers()
                    .into_iter()
                    .find(|peer| &peer.id == peer_id);
                let is_up = action == PeerUpdateAction::Started
                    || peer.as_ref().map(|p| p.is_up).unwrap_or(false);

                if let (Some(peer), true) = (peer, is_up) {
                    let _ordered = self.persist_order.lock();
                    {
                        let mut state = self.state.lock();
                        let is_current = state
                            .persistence_peer
                            .as_ref()
                            .map(|current| current.id == peer.id)
                            .unwrap_or(false);
                        if !is_current {
                            tracing::info!(
                                "[CLIENT {}] using persistence peer {}",
                                self.inner.peer_id(),
                                peer.id
                            );
                        }
                        state.persistence_peer = Some(peer.clone());
                        state.persistence_up = true;
                    }
                    self.flush_persist_queue(&peer);
                }
            }
            PeerUpdateAction::Stopped | PeerUpdateAction::Decommissioned => {
                let mut state = self.state.lock();
                let is_current = state
                    .persistence_peer
                    .as_ref()
                    .map(|peer| &peer.id == peer_id)
                    .unwrap_or(false);
                if is_current {
                    tracing::info!(
                        "[CLIENT {}] persistence peer {} is down",
                        self.inner.peer_id(),
                        peer_id
                    );
                    state.persistence_up = false;
                }
            }
        }

        self.inner.on_peer_updated(peer_id, action);
    }

    fn on_registered(&self) -> Result<()> {
        let persistence_peer = self.directory.persistence_peers().into_iter().next();
        {
            let mut state = self.state.lock();
            state.persistence_up = persistence_peer.as_ref().map(|p| p.is_up).unwrap_or(false);
            state.persistence_peer = persistence_peer.clone();
            if !self.config.is_persistent {
                state.phase.go_live();
            }
        }
        if !self.config.is_persistent {
            return self.inner.on_registered();
        }

        let peer = persistence_peer.ok_or(FerryError::NoPersistencePeer)?;
        let session_id = ReplaySessionId::new();
        let request = TransportMessage::new(&ReplayRequest { session_id }, self.inner.originator())?;

        // Entered before sending so an immediate reply is not dropped; undone
        // if the request never left.
        let previous = self.state.lock().phase.begin_replay(session_id);
        tracing::info!(
            "[CLIENT {}] requesting replay from {} (session {})",
            self.inner.peer_id(),
            peer.id,
            session_id
        );
        if let Err(e) = self.inner.send(request, vec![peer]) {
            let mut state = self.state.lock();
            if state.phase.session_id() == Some(session_id) {
                state.phase = previous;
            }
            return Err(e);
        }

        self.inner.on_registered()
    }

    fn ack_message(&self, message: &TransportMessage) -> Result<()> {
        if message.is_persistent() {
            self.send_to_persistence(&MessageHandledAck {
                message_id: message.id,
            })?;
        }
        self.inner.ack_message(message)
    }
}
