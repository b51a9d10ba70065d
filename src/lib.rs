//! # Ferry
//!
//! Reliable delivery for a persistent pub/sub bus. A persistent peer that
//! restarts asks a persistence service to replay what it missed, then goes
//! live without losing or double-delivering messages.
//!
//! This crate holds the peer side: the wire protocol shared with the
//! persistence service, the [`ReplayClient`] transport decorator and the
//! [`ReceiveQueue`] that hands inbound messages to the dispatcher in order.
//! The service itself lives in the companion `ferry-persistence` crate.
//!
//! ## Wiring a peer
//!
//! ```rust,no_run
//! use ferry::directory::InMemoryPeerDirectory;
//! use ferry::transport::testing::TestTransport;
//! use ferry::{ClientConfig, ReceiveQueue, ReplayClient, Transport, TransportMessage};
//! use std::sync::Arc;
//!
//! # async fn run() -> ferry::Result<()> {
//! let directory = InMemoryPeerDirectory::new();
//! let network = TestTransport::new("Orders.Handler.0", "tcp://orders:1");
//! let config = ClientConfig::from_env()?;
//!
//! // The client filters inbound traffic as it arrives; the queue above it
//! // only ever holds messages the application should see, in arrival order.
//! let stop_timeout = config.receive_stop_timeout();
//! let client = ReplayClient::new(network, directory, config);
//! let bus = ReceiveQueue::new(client.clone(), stop_timeout);
//! bus.set_message_received(Arc::new(|message: TransportMessage| {
//!     println!("handling {}", message.message_type_id);
//! }));
//!
//! bus.start().await?;
//! bus.on_registered()?;
//! println!("replay phase: {}", client.phase());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod replay;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use directory::{InMemoryPeerDirectory, PeerDirectory, PeerUpdateAction};
pub use error::{FerryError, Result};
pub use replay::{ReplayClient, ReplayPhaseKind};
pub use transport::testing;
pub use transport::{MessageReceivedHandler, ReceiveQueue, Transport};
pub use types::*;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
