use crate::config::PersistenceConfig;
use crate::error::{PersistenceError, Result};
use crate::session::ReplaySession;
use crate::store::MessageStore;
use ferry::{Peer, PeerId, ReplaySessionId, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<PeerId, Arc<ReplaySession>>,
    is_active: bool,
}

/// Tracks the active replay session of each peer.
pub struct ReplaySessionRegistry {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    config: Arc<PersistenceConfig>,
    state: Arc<Mutex<RegistryState>>,
}

impl ReplaySessionRegistry {
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        config: Arc<PersistenceConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            state: Arc::new(Mutex::new(RegistryState {
                sessions: HashMap::new(),
                is_active: true,
            })),
        }
    }

    pub fn create_session(
        &self,
        peer: Peer,
        session_id: ReplaySessionId,
    ) -> Result<Arc<ReplaySession>> {
        if !self.state.lock().is_active {
            return Err(PersistenceError::RegistryDeactivated);
        }
        Ok(ReplaySession::new(
            peer,
            session_id,
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.config),
        ))
    }

    /// Make `session` the active one for its peer. Returns the session it
    /// replaced, if any. The entry is dropped once the session completes.
    pub fn activate(&self, session: &Arc<ReplaySession>) -> Option<Arc<ReplaySession>> {
        let peer_id = session.peer_id().clone();
        let session_id = session.session_id();
        let previous = self
            .state
            .lock()
            .sessions
            .insert(peer_id.clone(), Arc::clone(session));

        let state = Arc::clone(&self.state);
        let mut completion = session.completion();
        tokio::spawn(async move {
            // An error means the session was dropped, which also ends it.
            let _ = completion.wait_for(|done| *done).await;
            let mut state = state.lock();
            let is_same = state
                .sessions
                .get(&peer_id)
                .map(|active| active.session_id() == session_id)
                .unwrap_or(false);
            if is_same {
                state.sessions.remove(&peer_id);
                tracing::debug!("[REGISTRY] session {} for {} removed", session_id, peer_id);
            }
        });

        previous
    }

    /// Refuse new sessions. Running sessions are left to finish.
    pub fn deactivate(&self) {
        self.state.lock().is_active = false;
        tracing::info!("[REGISTRY] deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active
    }

    pub fn has_active_sessions(&self) -> bool {
        !self.state.lock().sessions.is_empty()
    }

    pub fn active_session(&self, peer_id: &PeerId) -> Option<Arc<ReplaySession>> {
        self.state.lock().sessions.get(peer_id).cloned()
    }

    pub fn active_session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn active_sessions(&self) -> Vec<Arc<ReplaySession>> {
        self.state.lock().sessions.values().cloned().collect()
    }
}
