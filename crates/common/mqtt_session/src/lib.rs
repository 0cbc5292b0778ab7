//! A persistent MQTT session shared by every cloud-routed device of an account.
//!
//! The session owns a single connection to the broker and multiplexes it by
//! topic. On top of plain publish/subscribe it provides a request/response
//! primitive: a caller publishes a payload tagged with a request id and
//! suspends until the correlated response arrives, the deadline elapses, or
//! the session goes away. Payload framing is not this crate's business; the
//! caller's codec layer decodes inbound messages and resolves waiting
//! requests through [`MqttSession::complete_request`].
//!
//! On an unexpected connection loss every pending request fails immediately
//! with [`MqttSessionError::ConnectionLost`]: exactly-once delivery cannot be
//! guaranteed across a reconnect, so retrying is left to the caller. The
//! session itself reconnects with bounded exponential backoff until
//! [`MqttSession::close`] is called.

mod config;
mod errors;
mod messages;
mod requests;
mod session;
mod subscriptions;
mod topics;


pub use config::*;
pub use errors::*;
pub use messages::*;
pub use session::*;
pub use subscriptions::MessageCallback;
pub use subscriptions::SubscriptionHandle;
pub use topics::*;

pub use rumqttc::QoS;
