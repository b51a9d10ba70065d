//! Persistence peer for the ferry bus: durable per-peer backlogs and the
//! replay sessions that stream them back to restarting peers.

pub mod config;
pub mod error;
pub mod registry;
pub mod service;
pub mod session;
pub mod store;

pub use config::PersistenceConfig;
pub use error::{PersistenceError, Result};
pub use registry::ReplaySessionRegistry;
pub use service::PersistenceService;
pub use session::ReplaySession;
pub use store::{FileMessageStore, InMemoryMessageStore, MessageStore, StoredMessage};
