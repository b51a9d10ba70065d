//! Persistence peer: stores persisted traffic per target peer and serves
//! replay requests.

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::registry::ReplaySessionRegistry;
use crate::session::ReplaySession;
use crate::store::MessageStore;
use chrono::{DateTime, Utc};
use ferry::protocol::{
    MessageHandledAck, PersistRequest, PersistenceStopping, PersistenceStoppingAck,
    ReplayRequest,
};
use ferry::{
    MessageId, Peer, PeerDirectory, PeerId, PeerUpdateAction, ReplaySessionId, Transport,
    TransportMessage,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct CleanupLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PersistenceService {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn PeerDirectory>,
    store: Arc<dyn MessageStore>,
    config: Arc<PersistenceConfig>,
    registry: ReplaySessionRegistry,
    /// Peers that have not yet acknowledged `PersistenceStopping`.
    pending_stopping_acks: Mutex<HashSet<PeerId>>,
    stopping_acks: Notify,
    cleanup: Mutex<Option<CleanupLoop>>,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
}

impl PersistenceService {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
        store: Arc<dyn MessageStore>,
        config: PersistenceConfig,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = ReplaySessionRegistry::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&config),
        );

        Arc::new(Self {
            transport,
            directory,
            store,
            config,
            registry,
            pending_stopping_acks: Mutex::new(HashSet::new()),
            stopping_acks: Notify::new(),
            cleanup: Mutex::new(None),
            last_cleanup: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &ReplaySessionRegistry {
        &self.registry
    }

    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        *self.last_cleanup.lock()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.transport
            .set_message_received(Arc::new(move |message: TransportMessage| {
                if let Some(service) = weak.upgrade() {
                    service.on_message_received(message);
                }
            }));

        let weak = Arc::downgrade(self);
        self.directory
            .subscribe(Arc::new(move |peer_id: &PeerId, action: PeerUpdateAction| {
                if action == PeerUpdateAction::Decommissioned {
                    if let Some(service) = weak.upgrade() {
                        service.on_peer_decommissioned(peer_id);
                    }
                }
            }));

        self.transport.start().await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(cleanup_loop(
            Arc::downgrade(self),
            self.config.cleanup_interval(),
            cancel.clone(),
        ));
        *self.cleanup.lock() = Some(CleanupLoop { cancel, handle });

        tracing::info!("[PERSIST] started as {}", self.transport.peer_id());
        Ok(())
    }

    fn on_message_received(&self, message: TransportMessage) {
        let sender = message.sender();

        if message.is::<ReplayRequest>() {
            match message.decode::<ReplayRequest>() {
                Ok(request) => {
                    let peer = self.directory.get_peer(&sender.id).unwrap_or(sender);
                    self.on_replay_request(peer, request.session_id);
                }
                Err(e) => tracing::warn!("[PERSIST] bad replay request from {}: {}", sender.id, e),
            }
        } else if message.is::<PersistRequest>() {
            match message.decode::<PersistRequest>() {
                Ok(request) => self.on_persist_request(request),
                Err(e) => tracing::warn!("[PERSIST] bad persist request from {}: {}", sender.id, e),
            }
        } else if message.is::<MessageHandledAck>() {
            match message.decode::<MessageHandledAck>() {
                Ok(ack) => self.on_message_handled(&sender.id, ack.message_id),
                Err(e) => tracing::warn!("[PERSIST] bad ack from {}: {}", sender.id, e),
            }
        } else if message.is::<PersistenceStoppingAck>() {
            let remaining = {
                let mut pending = self.pending_stopping_acks.lock();
                pending.remove(&sender.id);
                pending.len()
            };
            tracing::debug!(
                "[PERSIST] {} acked stopping, {} remaining",
                sender.id,
                remaining
            );
            self.stopping_acks.notify_one();
        } else {
            tracing::debug!(
                "[PERSIST] ignoring {} from {}",
                message.message_type_id,
                sender.id
            );
        }
    }

    /// Registers the new session right away so the latest request wins;
    /// the previous session is cancelled before the new one starts.
    fn on_replay_request(&self, peer: Peer, session_id: ReplaySessionId) {
        tracing::info!(
            "[PERSIST] replay requested by {} (session {})",
            peer.id,
            session_id
        );

        let session = match self.registry.create_session(peer, session_id) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("[PERSIST] dropping replay request {}: {}", session_id, e);
                return;
            }
        };
        let previous = self.registry.activate(&session);

        tokio::spawn(async move {
            if let Some(previous) = previous {
                cancel_session(&previous).await;
            }
            session.start();
        });
    }

    fn on_persist_request(&self, request: PersistRequest) {
        let message = request.message;
        for peer_id in &request.persistent_peer_ids {
            if let Err(e) = self.store.append(peer_id, &message) {
                tracing::error!(
                    "[PERSIST] failed to store {} for {}: {}",
                    message.id,
                    peer_id,
                    e
                );
                continue;
            }
            if self.config.is_verbose(peer_id) {
                tracing::info!(
                    "[PERSIST] stored {} ({}) for {}",
                    message.id,
                    message.message_type_id,
                    peer_id
                );
            }
            if let Some(session) = self.registry.active_session(peer_id) {
                session.add_live_message(message.clone());
            }
        }
    }

    /// Record that `peer_id` finished handling `message_id`.
    pub fn on_message_handled(&self, peer_id: &PeerId, message_id: MessageId) {
        if let Err(e) = self.store.mark_acked(peer_id, message_id) {
            tracing::error!(
                "[PERSIST] failed to ack {} for {}: {}",
                message_id,
                peer_id,
                e
            );
        }
        if self.config.is_verbose(peer_id) {
            tracing::info!("[PERSIST] {} acked {}", peer_id, message_id);
        }
        if let Some(session) = self.registry.active_session(peer_id) {
            session.on_message_acked(message_id);
        }
    }

    fn on_peer_decommissioned(&self, peer_id: &PeerId) {
        if let Some(session) = self.registry.active_session(peer_id) {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session.cancel().await;
            });
        }
        match self.store.delete_all_for_peer(peer_id) {
            Ok(()) => tracing::info!("[PERSIST] {} decommissioned, backlog deleted", peer_id),
            Err(e) => tracing::error!(
                "[PERSIST] failed to delete backlog of {}: {}",
                peer_id,
                e
            ),
        }
    }

    /// Drop acknowledged messages older than the retention period. A peer
    /// whose backlog cannot be purged is logged and skipped.
    pub fn purge_acknowledged(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.ack_retention()).ok();
        let Some(cutoff) = retention.and_then(|r| Utc::now().checked_sub_signed(r)) else {
            return 0;
        };

        let mut purged = 0;
        for peer_id in self.store.peer_ids() {
            match self.store.purge_acknowledged_before(&peer_id, cutoff) {
                Ok(count) => purged += count,
                Err(e) => tracing::error!("[PERSIST] failed to purge backlog of {}: {}", peer_id, e),
            }
        }
        *self.last_cleanup.lock() = Some(Utc::now());
        if purged > 0 {
            tracing::info!("[PERSIST] purged {} acknowledged messages", purged);
        }
        purged
    }

    pub async fn stop(&self) -> Result<()> {
        self.registry.deactivate();
        self.notify_stopping().await;
        self.wait_for_sessions().await;

        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup.cancel.cancel();
            if let Err(e) = cleanup.handle.await {
                tracing::error!("[PERSIST] cleanup loop ended abnormally: {}", e);
            }
        }

        self.transport.stop().await?;
        tracing::info!("[PERSIST] stopped");
        Ok(())
    }

    async fn notify_stopping(&self) {
        let self_id = self.transport.peer_id();
        let targets: Vec<Peer> = self
            .directory
            .peers()
            .into_iter()
            .filter(|peer| peer.is_up && peer.id != self_id)
            .collect();
        if targets.is_empty() {
            return;
        }

        *self.pending_stopping_acks.lock() = targets.iter().map(|peer| peer.id.clone()).collect();
        let sent = TransportMessage::new(&PersistenceStopping, self.transport.originator())
            .and_then(|message| self.transport.send(message, targets.clone()));
        if let Err(e) = sent {
            tracing::error!("[PERSIST] failed to announce stop: {}", e);
            self.pending_stopping_acks.lock().clear();
            return;
        }
        tracing::info!("[PERSIST] announced stop to {} peers", targets.len());

        let wait = async {
            while !self.pending_stopping_acks.lock().is_empty() {
                self.stopping_acks.notified().await;
            }
        };
        if tokio::time::timeout(self.config.persistence_stopping_timeout(), wait)
            .await
            .is_err()
        {
            let missing = self.pending_stopping_acks.lock().len();
            tracing::warn!(
                "[PERSIST] {} peers did not ack stop in time, continuing",
                missing
            );
        }
    }

    async fn wait_for_sessions(&self) {
        let wait = async {
            while self.registry.has_active_sessions() {
                tokio::time::sleep(SESSION_POLL_INTERVAL).await;
            }
        };
        if tokio::time::timeout(self.config.persistence_stopping_timeout(), wait)
            .await
            .is_err()
        {
            let remaining = self.registry.active_sessions();
            tracing::warn!(
                "[PERSIST] {} replay sessions still running, cancelling",
                remaining.len()
            );
            for session in remaining {
                cancel_session(&session).await;
            }
        }
    }
}

async fn cancel_session(session: &ReplaySession) {
    if !session.cancel().await {
        tracing::warn!(
            "[PERSIST] session {} for {} may still be running",
            session.session_id(),
            session.peer_id()
        );
    }
}

async fn cleanup_loop(
    service: Weak<PersistenceService>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let Some(service) = service.upgrade() else {
            return;
        };
        service.purge_acknowledged();
    }
}
