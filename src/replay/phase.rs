use crate::types::{MessageId, ReplaySessionId, TransportMessage};
use std::collections::HashSet;

/// Observable replay phase of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPhaseKind {
    Idle,
    Replaying,
    SafetyWindow,
    Live,
}

impl std::fmt::Display for ReplayPhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayPhaseKind::Idle => write!(f, "idle"),
            ReplayPhaseKind::Replaying => write!(f, "replaying"),
            ReplayPhaseKind::SafetyWindow => write!(f, "safety-window"),
            ReplayPhaseKind::Live => write!(f, "live"),
        }
    }
}

/// Inbound filtering state. Transitions only move forward for a given
/// session id; a new session id restarts at `Replaying`.
#[derive(Debug)]
pub(crate) enum ReplayPhase {
    Idle,
    Replaying {
        session_id: ReplaySessionId,
    },
    SafetyWindow {
        session_id: ReplaySessionId,
        seen: HashSet<MessageId>,
    },
    Live {
        session_id: Option<ReplaySessionId>,
    },
}

impl ReplayPhase {
    pub(crate) fn kind(&self) -> ReplayPhaseKind {
        match self {
            ReplayPhase::Idle => ReplayPhaseKind::Idle,
            ReplayPhase::Replaying { .. } => ReplayPhaseKind::Replaying,
            ReplayPhase::SafetyWindow { .. } => ReplayPhaseKind::SafetyWindow,
            ReplayPhase::Live { .. } => ReplayPhaseKind::Live,
        }
    }

    pub(crate) fn session_id(&self) -> Option<ReplaySessionId> {
        match self {
            ReplayPhase::Idle => None,
            ReplayPhase::Replaying { session_id } => Some(*session_id),
            ReplayPhase::SafetyWindow { session_id, .. } => Some(*session_id),
            ReplayPhase::Live { session_id } => *session_id,
        }
    }

    /// Returns the phase it replaced.
    pub(crate) fn begin_replay(&mut self, session_id: ReplaySessionId) -> ReplayPhase {
        std::mem::replace(self, ReplayPhase::Replaying { session_id })
    }

    /// Transient peers skip replay entirely.
    pub(crate) fn go_live(&mut self) {
        if matches!(self, ReplayPhase::Idle) {
            *self = ReplayPhase::Live { session_id: None };
        }
    }

    /// Returns the message if it should reach the application.
    pub(crate) fn on_live_message(
        &mut self,
        message: TransportMessage,
    ) -> Option<TransportMessage> {
        match self {
            ReplayPhase::Idle | ReplayPhase::Live { .. } => Some(message),
            // It will come back through replay, or was not meant for this window.
            ReplayPhase::Replaying { .. } => None,
            ReplayPhase::SafetyWindow { seen, .. } => seen.insert(message.id).then_some(message),
        }
    }

    pub(crate) fn on_replayed_message(
        &mut self,
        session_id: ReplaySessionId,
        message: TransportMessage,
    ) -> Option<TransportMessage> {
        if self.session_id() != Some(session_id) {
            return None;
        }
        match self {
            ReplayPhase::Idle => None,
            ReplayPhase::Replaying { .. } | ReplayPhase::Live { .. } => Some(message),
            ReplayPhase::SafetyWindow { seen, .. } => seen.insert(message.id).then_some(message),
        }
    }

    /// Returns true if this marker moved the phase to `SafetyWindow`.
    pub(crate) fn on_replay_phase_ended(&mut self, session_id: ReplaySessionId) -> bool {
        match self {
            ReplayPhase::Replaying { session_id: current } if *current == session_id => {
                *self = ReplayPhase::SafetyWindow {
                    session_id,
                    seen: HashSet::new(),
                };
                true
            }
            _ => false,
        }
    }

    /// Returns true if this marker moved the phase to `Live`. The dedup set
    /// is dropped with the old state.
    pub(crate) fn on_safety_phase_ended(&mut self, session_id: ReplaySessionId) -> bool {
        match self {
            ReplayPhase::SafetyWindow {
                session_id: current,
                ..
            } if *current == session_id => {
                *self = ReplayPhase::Live {
                    session_id: Some(session_id),
                };
                true
            }
            _ => false,
        }
    }
}
