use mqtt_session::MqttSessionError;
use std::time::Duration;

/// The error taxonomy of the device-management core.
///
/// Background failures (inventory refresh, reconnection) never surface as
/// raised errors: they are contained by the device manager and reported as
/// lifecycle notifications. This type reaches callers only through explicit
/// operations such as `send`.
#[derive(thiserror::Error, Debug)]
pub enum RovacError {
    #[error("Authentication with the account failed: {reason}")]
    Authentication { reason: String },

    /// Transport-level failure; retryable
    #[error("Connectivity failure: {reason}")]
    Connectivity { reason: String },

    /// Per-command timeout; the caller may retry
    #[error("No response within {timeout:?}")]
    RequestTimeout { timeout: Duration },

    /// Malformed or unexpected response; not retried automatically
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    /// The persistence layer degrades to "absent", it never aborts the core
    #[error("Cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    /// Decoded into the generic capability set rather than failing
    #[error("Unknown device model: {model}")]
    UnknownDeviceModel { model: String },

    #[error("Unknown device: {duid}")]
    UnknownDevice { duid: String },

    #[error("The device manager has been closed")]
    Closed,
}

impl From<MqttSessionError> for RovacError {
    fn from(err: MqttSessionError) -> Self {
        match err {
            MqttSessionError::RequestTimeout { timeout, .. } => {
                RovacError::RequestTimeout { timeout }
            }
            MqttSessionError::ConnectionLost | MqttSessionError::SessionClosed => {
                RovacError::Connectivity {
                    reason: err.to_string(),
                }
            }
            MqttSessionError::ClientError(_) => RovacError::Connectivity {
                reason: err.to_string(),
            },
            MqttSessionError::InvalidTopic { .. }
            | MqttSessionError::InvalidFilter { .. }
            | MqttSessionError::DuplicateRequestId { .. }
            | MqttSessionError::InvalidUtf8Payload { .. } => RovacError::Protocol {
                reason: err.to_string(),
            },
        }
    }
}
