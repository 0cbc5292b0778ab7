//! Per-device connections and the fleet orchestrator.
//!
//! A [`DeviceConnection`] is the per-device façade over either the shared
//! account [`MqttSession`](mqtt_session::MqttSession) or a dedicated
//! local-network transport. It owns the device's connectivity state and the
//! retry policy, and reports `Connected ⇄ Disconnected` transitions over a
//! one-way channel; it holds no reference back into the manager.
//!
//! The [`DeviceManager`] owns the inventory: it loads a cached snapshot
//! without touching the network, computes capabilities, announces every
//! device as ready, connects in the background, and periodically reconciles
//! the inventory against the account collaborator.

mod channel;
mod connection;
mod manager;

#[cfg(test)]
mod tests;

pub use channel::*;
pub use connection::*;
pub use manager::*;
