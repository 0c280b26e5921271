//! Simulation support for swarmlink
//!
//! Provides [`WsTracker`], an in-memory WebSocket tracker speaking the
//! announce protocol, so integration tests exercise the real socket and
//! signaling paths without external trackers.

pub mod tracker;

pub use tracker::WsTracker;
