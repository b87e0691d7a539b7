//! Real-time fan-out of queue state changes to observing clients.

pub mod hub;

pub use hub::{BroadcastHub, ConnectionError, ObserverConnection, QueueEvent};
