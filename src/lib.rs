//! Kameo-based realtime connection & synchronization engine.
//!
//! One actor owns the change-feed connection, the reconnect state machine and
//! the refresh pipeline; consumers observe [`core::ConnectionState`] snapshots
//! through a watch channel and register [`core::Topic`]s via [`sync::SyncHandle`].

pub mod core;
pub mod lifecycle;
pub mod probe;
pub mod sync;
pub mod testing;
pub mod tls;
pub mod transport;

pub use sync::{RefreshDispatcher, SyncEngine, SyncEngineArgs, SyncHandle};
