use ferry::PeerId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Backlog messages sent per batch.
    pub replay_batch_size: usize,
    /// The next batch is released once at most this many replayed messages
    /// are still waiting for an ack.
    pub replay_unacked_message_count_that_releases_next_batch: usize,
    pub safety_phase_duration_ms: u64,
    pub persistence_stopping_timeout_ms: u64,
    /// How long cancelling a replay session waits for it to finish.
    pub session_cancel_timeout_ms: u64,
    /// Peers whose messages are traced individually.
    pub peer_ids_to_investigate: Vec<PeerId>,
    /// Live messages buffered per session until the safety window drains them.
    pub live_buffer_capacity: usize,
    pub ack_retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            replay_batch_size: 100,
            replay_unacked_message_count_that_releases_next_batch: 200,
            safety_phase_duration_ms: 30_000,
            persistence_stopping_timeout_ms: 10_000,
            session_cancel_timeout_ms: 5_000,
            peer_ids_to_investigate: Vec::new(),
            live_buffer_capacity: 10_000,
            ack_retention_secs: 86_400,
            cleanup_interval_secs: 3_600,
        }
    }
}

impl PersistenceConfig {
    /// Load from {data_dir}/persistence.json, falling back to defaults, then
    /// apply FERRY_* environment overrides.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let config_json = data_dir.join("persistence.json");
        let mut config = Self::default();

        if config_json.exists() {
            match std::fs::read_to_string(&config_json) {
                Ok(content) => match serde_json::from_str::<PersistenceConfig>(&content) {
                    Ok(loaded) => {
                        tracing::info!(
                            "Loaded persistence config: batch={}, safety={}ms",
                            loaded.replay_batch_size,
                            loaded.safety_phase_duration_ms
                        );
                        config = loaded;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse persistence.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read persistence.json: {}, using defaults", e);
                }
            }
        }

        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        override_from_env("FERRY_REPLAY_BATCH_SIZE", &mut self.replay_batch_size);
        override_from_env(
            "FERRY_REPLAY_UNACKED_THRESHOLD",
            &mut self.replay_unacked_message_count_that_releases_next_batch,
        );
        override_from_env(
            "FERRY_SAFETY_PHASE_DURATION_MS",
            &mut self.safety_phase_duration_ms,
        );
        override_from_env(
            "FERRY_PERSISTENCE_STOPPING_TIMEOUT_MS",
            &mut self.persistence_stopping_timeout_ms,
        );
        override_from_env(
            "FERRY_SESSION_CANCEL_TIMEOUT_MS",
            &mut self.session_cancel_timeout_ms,
        );
        override_from_env("FERRY_LIVE_BUFFER_CAPACITY", &mut self.live_buffer_capacity);
        override_from_env("FERRY_ACK_RETENTION_SECS", &mut self.ack_retention_secs);
        override_from_env("FERRY_CLEANUP_INTERVAL_SECS", &mut self.cleanup_interval_secs);

        if let Ok(value) = std::env::var("FERRY_PEER_IDS_TO_INVESTIGATE") {
            self.peer_ids_to_investigate = value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(PeerId::from)
                .collect();
        }
    }

    pub fn safety_phase_duration(&self) -> Duration {
        Duration::from_millis(self.safety_phase_duration_ms)
    }

    pub fn persistence_stopping_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_stopping_timeout_ms)
    }

    pub fn session_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.session_cancel_timeout_ms)
    }

    pub fn ack_retention(&self) -> Duration {
        Duration::from_secs(self.ack_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn is_verbose(&self, peer_id: &PeerId) -> bool {
        self.peer_ids_to_investigate.contains(peer_id)
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring invalid {}={}", key, value),
        }
    }
}
