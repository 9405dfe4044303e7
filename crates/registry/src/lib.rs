//! Subscription and connection bookkeeping.
//!
//! [`ChannelRegistry`] keeps the bidirectional channel/subscriber indexes the
//! fan-out path reads; [`ConnectionManager`] enforces the one-socket-per-user
//! discipline. Both hold socket ids only — the gateway owns socket lifetime
//! and notifies these indexes on disconnect.

mod channels;
mod connections;

pub use {
    channels::{ChannelInfo, ChannelRegistry, ChannelTop, RegistryError, RegistryStats},
    connections::{ClaimOutcome, ConnectionManager, ManagerConfig, ManagerStats, SlotInfo},
};
