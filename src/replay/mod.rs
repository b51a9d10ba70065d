//! Replay-aware transport decorator for persistent peers.

pub mod client;
mod phase;

pub use client::ReplayClient;
pub use phase::ReplayPhaseKind;
