//! One replay of one peer's backlog.
//!
//! A session streams the peer's unacknowledged backlog in flow-controlled
//! batches, marks the end of the backlog, then forwards the live traffic it
//! buffered meanwhile for the length of the safety window before marking the
//! end of that too. Every message it sends is a `ReplayedMessage` tagged with
//! the session id.

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::store::MessageStore;
use dashmap::DashSet;
use ferry::protocol::{ReplayPhaseEnded, ReplayedMessage, SafetyPhaseEnded};
use ferry::{Message, MessageId, Peer, PeerId, ReplaySessionId, Transport, TransportMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const ACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ReplaySession {
    peer: Peer,
    session_id: ReplaySessionId,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    config: Arc<PersistenceConfig>,
    in_flight: DashSet<MessageId>,
    live_tx: mpsc::Sender<TransportMessage>,
    live_rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    cancel: CancellationToken,
    completed: watch::Sender<bool>,
    started: AtomicBool,
    replayed_count: AtomicUsize,
    live_count: AtomicUsize,
}

/// Signals completion when the run future ends, however it ends.
struct CompletionGuard<'a>(&'a watch::Sender<bool>);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

enum Outcome {
    Finished,
    Cancelled,
}

impl ReplaySession {
    pub fn new(
        peer: Peer,
        session_id: ReplaySessionId,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        config: Arc<PersistenceConfig>,
    ) -> Arc<Self> {
        let (live_tx, live_rx) = mpsc::channel(config.live_buffer_capacity.max(1));
        let (completed, _) = watch::channel(false);

        Arc::new(Self {
            peer,
            session_id,
            store,
            transport,
            config,
            in_flight: DashSet::new(),
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
            cancel: CancellationToken::new(),
            completed,
            started: AtomicBool::new(false),
            replayed_count: AtomicUsize::new(0),
            live_count: AtomicUsize::new(0),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer.id
    }

    pub fn session_id(&self) -> ReplaySessionId {
        self.session_id
    }

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "[REPLAY {}] session {} already started",
                self.peer.id,
                self.session_id
            );
            return;
        }
        tokio::spawn(Arc::clone(self).run());
    }

    /// Buffer a message persisted for this peer while the session runs.
    pub fn add_live_message(&self, message: TransportMessage) {
        if self.is_completed() {
            return;
        }
        if let Err(e) = self.live_tx.try_send(message) {
            tracing::warn!(
                "[REPLAY {}] live buffer full ({}), dropping message: {}",
                self.peer.id,
                self.config.live_buffer_capacity,
                e
            );
        }
    }

    pub fn on_message_acked(&self, message_id: MessageId) {
        self.in_flight.remove(&message_id);
    }

    pub fn unacked_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completed.subscribe()
    }

    /// Wait up to `timeout` for the session to finish.
    pub async fn wait_completed(&self, timeout: Duration) -> bool {
        let mut completion = self.completed.subscribe();
        let done = matches!(
            tokio::time::timeout(timeout, completion.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }

    /// Stop the session and wait for it to finish. Returns false if it is
    /// still running after `session_cancel_timeout`.
    pub async fn cancel(&self) -> bool {
        self.cancel.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.completed.send_replace(true);
            return true;
        }
        self.wait_completed(self.config.session_cancel_timeout()).await
    }

    async fn run(self: Arc<Self>) {
        let _completion = CompletionGuard(&self.completed);
        let live_rx = self.live_rx.lock().take();
        let Some(mut live_rx) = live_rx else {
            return;
        };

        tracing::info!(
            "[REPLAY {}] session {} starting",
            self.peer.id,
            self.session_id
        );

        match self.execute(&mut live_rx).await {
            Ok(Outcome::Finished) => tracing::info!(
                "[REPLAY {}] session {} done: {} replayed, {} live",
                self.peer.id,
                self.session_id,
                self.replayed_count.load(Ordering::Relaxed),
                self.live_count.load(Ordering::Relaxed)
            ),
            Ok(Outcome::Cancelled) => tracing::info!(
                "[REPLAY {}] session {} cancelled after {} replayed",
                self.peer.id,
                self.session_id,
                self.replayed_count.load(Ordering::Relaxed)
            ),
            Err(e) => tracing::error!(
                "[REPLAY {}] session {} failed: {}",
                self.peer.id,
                self.session_id,
                e
            ),
        }
    }

    async fn execute(&self, live_rx: &mut mpsc::Receiver<TransportMessage>) -> Result<Outcome> {
        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let Some(replayed) = self.replay_backlog().await? else {
            return Ok(Outcome::Cancelled);
        };
        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        self.send(&ReplayPhaseEnded {
            session_id: self.session_id,
        });

        if !self.forward_live_messages(live_rx, &replayed).await {
            return Ok(Outcome::Cancelled);
        }
        self.send(&SafetyPhaseEnded {
            session_id: self.session_id,
        });

        Ok(Outcome::Finished)
    }

    /// Returns the replayed ids, or None if cancelled.
    async fn replay_backlog(&self) -> Result<Option<HashSet<MessageId>>> {
        self.store.flush(&self.peer.id)?;
        let mut cursor = self.store.read_unacked_ordered(&self.peer.id)?;
        let batch_size = self.config.replay_batch_size.max(1);
        let mut replayed = HashSet::new();

        loop {
            if !self.wait_for_ack_threshold().await {
                return Ok(None);
            }

            for _ in 0..batch_size {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let Some(entry) = cursor.next() else {
                    return Ok(Some(replayed));
                };
                let stored = entry?;
                let message_id = stored.message_id;

                if self.config.is_verbose(&self.peer.id) {
                    tracing::info!(
                        "[REPLAY {}] replaying {} ({})",
                        self.peer.id,
                        message_id,
                        stored.message.message_type_id
                    );
                }

                if self.send_replayed(stored.message) {
                    self.in_flight.insert(message_id);
                }
                replayed.insert(message_id);
                self.replayed_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn wait_for_ack_threshold(&self) -> bool {
        let threshold = self
            .config
            .replay_unacked_message_count_that_releases_next_batch;
        while self.in_flight.len() > threshold {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(ACK_POLL_INTERVAL) => {}
            }
        }
        !self.cancel.is_cancelled()
    }

    /// Forward buffered live traffic until the safety window closes. Returns
    /// false if cancelled.
    async fn forward_live_messages(
        &self,
        live_rx: &mut mpsc::Receiver<TransportMessage>,
        replayed: &HashSet<MessageId>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.safety_phase_duration();

        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                received = live_rx.recv() => received,
            };
            let Some(message) = received else {
                // Unreachable while the session owns the sender.
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                return !self.cancel.is_cancelled();
            };

            if replayed.contains(&message.id) {
                continue;
            }
            if self.config.is_verbose(&self.peer.id) {
                tracing::info!(
                    "[REPLAY {}] forwarding live {} ({})",
                    self.peer.id,
                    message.id,
                    message.message_type_id
                );
            }
            self.send_replayed(message);
            self.live_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send_replayed(&self, message: TransportMessage) -> bool {
        self.send(&ReplayedMessage {
            session_id: self.session_id,
            message,
        })
    }

    fn send<M: Message>(&self, message: &M) -> bool {
        let result = TransportMessage::new(message, self.transport.originator())
            .and_then(|message| self.transport.send(message, vec![self.peer.clone()]));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "[REPLAY {}] failed to send {}: {}",
                    self.peer.id,
                    M::TYPE_NAME,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryMessageStore, MessageCursor, StoredMessage};
    use chrono::{DateTime, Utc};
    use ferry::testing::TestTransport;
    use ferry::OriginatorInfo;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u32,
    }

    impl Message for OrderPlaced {
        const TYPE_NAME: &'static str = "Test.OrderPlaced";
    }

    struct Fixture {
        transport: Arc<TestTransport>,
        store: Arc<InMemoryMessageStore>,
        peer: Peer,
    }

    fn fixture() -> Fixture {
        Fixture {
            transport: TestTransport::new("Test.Persistence.0", "tcp://persistence:1"),
            store: Arc::new(InMemoryMessageStore::new()),
            peer: Peer::new("Test.Client.0", "tcp://client:1"),
        }
    }

    fn config(safety_ms: u64) -> Arc<PersistenceConfig> {
        Arc::new(PersistenceConfig {
            safety_phase_duration_ms: safety_ms,
            ..PersistenceConfig::default()
        })
    }

    fn order(order_id: u32) -> TransportMessage {
        TransportMessage::new(
            &OrderPlaced { order_id },
            OriginatorInfo::new(PeerId::new("Test.Sender.0"), "tcp://sender:1"),
        )
        .unwrap()
    }

    fn session(f: &Fixture, config: Arc<PersistenceConfig>) -> Arc<ReplaySession> {
        ReplaySession::new(
            f.peer.clone(),
            ReplaySessionId::new(),
            f.store.clone(),
            f.transport.clone(),
            config,
        )
    }

    /// Kind tag per sent message: R(id) replayed, E replay end, S safety end.
    fn output(f: &Fixture) -> Vec<String> {
        f.transport
            .sent_messages()
            .iter()
            .map(|sent| {
                if let Ok(replayed) = sent.message.decode::<ReplayedMessage>() {
                    let order = replayed.message.decode::<OrderPlaced>().unwrap();
                    format!("R{}", order.order_id)
                } else if sent.message.is::<ReplayPhaseEnded>() {
                    "E".to_string()
                } else if sent.message.is::<SafetyPhaseEnded>() {
                    "S".to_string()
                } else {
                    format!("?{}", sent.message.message_type_id)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replays_backlog_then_markers() {
        let f = fixture();
        f.store.append(&f.peer.id, &order(1)).unwrap();
        f.store.append(&f.peer.id, &order(2)).unwrap();

        let session = session(&f, config(0));
        session.start();
        assert!(session.wait_completed(Duration::from_secs(5)).await);

        assert_eq!(output(&f), vec!["R1", "R2", "E", "S"]);
        for sent in f.transport.sent_messages() {
            assert_eq!(sent.targets, vec![f.peer.clone()]);
        }
        assert_eq!(session.unacked_count(), 2);
    }

    #[tokio::test]
    async fn test_all_output_tagged_with_session_id() {
        let f = fixture();
        f.store.append(&f.peer.id, &order(1)).unwrap();
        let session = session(&f, config(0));
        session.start();
        assert!(session.wait_completed(Duration::from_secs(5)).await);

        let id = session.session_id();
        assert!(f
            .transport
            .sent_messages_of::<ReplayedMessage>()
            .iter()
            .all(|(m, _)| m.session_id == id));
        assert_eq!(f.transport.sent_messages_of::<ReplayPhaseEnded>()[0].0.session_id, id);
        assert_eq!(f.transport.sent_messages_of::<SafetyPhaseEnded>()[0].0.session_id, id);
    }

    #[tokio::test]
    async fn test_empty_backlog_sends_only_markers() {
        let f = fixture();
        let session = session(&f, config(0));
        session.start();
        assert!(session.wait_completed(Duration::from_secs(5)).await);

        assert_eq!(output(&f), vec!["E", "S"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_window_forwards_live_after_replay_end() {
        let f = fixture();
        f.store.append(&f.peer.id, &order(1)).unwrap();
        let session = session(&f, config(30_000));

        session.add_live_message(order(7));
        session.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.add_live_message(order(8));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(output(&f), vec!["R1", "E", "R7", "R8"]);
        assert!(!session.is_completed());

        // No more live traffic: the window still runs its full length.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(session.is_completed());
        assert_eq!(output(&f), vec!["R1", "E", "R7", "R8", "S"]);
    }

    #[tokio::test]
    async fn test_live_copy_of_replayed_message_not_resent() {
        let f = fixture();
        let m = order(1);
        f.store.append(&f.peer.id, &m).unwrap();
        let session = session(&f, config(0));
        session.add_live_message(m);

        session.start();
        assert!(session.wait_completed(Duration::from_secs(5)).await);

        assert_eq!(output(&f), vec!["R1", "E", "S"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_wait_for_acks() {
        let f = fixture();
        for i in 0..5 {
            f.store.append(&f.peer.id, &order(i)).unwrap();
        }
        let config = Arc::new(PersistenceConfig {
            replay_batch_size: 2,
            replay_unacked_message_count_that_releases_next_batch: 1,
            safety_phase_duration_ms: 0,
            ..PersistenceConfig::default()
        });
        let session = session(&f, config);
        session.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(output(&f), vec!["R0", "R1"]);

        let first = f.transport.sent_messages_of::<ReplayedMessage>()[0].0.message.id;
        session.on_message_acked(first);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(output(&f), vec!["R0", "R1", "R2", "R3"]);

        for (replayed, _) in f.transport.sent_messages_of::<ReplayedMessage>() {
            session.on_message_acked(replayed.message.id);
        }
        assert!(session.wait_completed(Duration::from_secs(5)).await);
        assert_eq!(output(&f), vec!["R0", "R1", "R2", "R3", "R4", "E", "S"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_safety_window_sends_no_marker() {
        let f = fixture();
        let session = session(&f, config(30_000));
        session.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output(&f), vec!["E"]);

        assert!(session.cancel().await);
        assert!(session.is_completed());

        session.add_live_message(order(9));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(output(&f), vec!["E"]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_completes_without_output() {
        let f = fixture();
        f.store.append(&f.peer.id, &order(1)).unwrap();
        let session = session(&f, config(0));

        assert!(session.cancel().await);
        assert!(session.is_completed());

        session.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.transport.sent_messages().is_empty());
    }

    struct FailingStore;

    impl MessageStore for FailingStore {
        fn append(&self, _: &PeerId, _: &TransportMessage) -> Result<()> {
            Ok(())
        }
        fn mark_acked(&self, _: &PeerId, _: MessageId) -> Result<()> {
            Ok(())
        }
        fn read_unacked_ordered(&self, _: &PeerId) -> Result<MessageCursor> {
            let failing: Vec<Result<StoredMessage>> = vec![Err(
                crate::error::PersistenceError::Store("disk on fire".into()),
            )];
            Ok(Box::new(failing.into_iter()))
        }
        fn delete_all_for_peer(&self, _: &PeerId) -> Result<()> {
            Ok(())
        }
        fn purge_acknowledged_before(&self, _: &PeerId, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        fn peer_ids(&self) -> Vec<PeerId> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_store_failure_still_completes() {
        let f = fixture();
        let session = ReplaySession::new(
            f.peer.clone(),
            ReplaySessionId::new(),
            Arc::new(FailingStore),
            f.transport.clone(),
            config(0),
        );
        session.start();

        assert!(session.wait_completed(Duration::from_secs(5)).await);
        assert!(f.transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_failures_do_not_count_as_in_flight() {
        let f = fixture();
        f.store.append(&f.peer.id, &order(1)).unwrap();
        f.transport.set_fail_sends(true);
        let session = session(&f, config(0));
        session.start();

        assert!(session.wait_completed(Duration::from_secs(5)).await);
        assert_eq!(session.unacked_count(), 0);
    }

    /// Backlog cursor whose first read takes `delay`.
    struct SlowStore {
        delay: Duration,
    }

    impl MessageStore for SlowStore {
        fn append(&self, _: &PeerId, _: &TransportMessage) -> Result<()> {
            Ok(())
        }
        fn mark_acked(&self, _: &PeerId, _: MessageId) -> Result<()> {
            Ok(())
        }
        fn read_unacked_ordered(&self, peer_id: &PeerId) -> Result<MessageCursor> {
            let delay = self.delay;
            let peer_id = peer_id.clone();
            let slow = std::iter::once(()).map(move |()| {
                std::thread::sleep(delay);
                Ok(StoredMessage::new(peer_id.clone(), order(1)))
            });
            Ok(Box::new(slow))
        }
        fn delete_all_for_peer(&self, _: &PeerId) -> Result<()> {
            Ok(())
        }
        fn purge_acknowledged_before(&self, _: &PeerId, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        fn peer_ids(&self) -> Vec<PeerId> {
            Vec::new()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_times_out_while_store_read_blocks() {
        let f = fixture();
        let session = ReplaySession::new(
            f.peer.clone(),
            ReplaySessionId::new(),
            Arc::new(SlowStore {
                delay: Duration::from_millis(500),
            }),
            f.transport.clone(),
            Arc::new(PersistenceConfig {
                safety_phase_duration_ms: 0,
                session_cancel_timeout_ms: 50,
                ..PersistenceConfig::default()
            }),
        );
        session.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!session.cancel().await);
        assert!(!session.is_completed());

        // The read eventually returns and the session sees the cancellation.
        assert!(session.wait_completed(Duration::from_secs(5)).await);
        assert!(f.transport.sent_messages_of::<ReplayPhaseEnded>().is_empty());
    }
}
