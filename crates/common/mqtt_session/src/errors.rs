use std::time::Duration;

/// An MQTT session error
#[derive(thiserror::Error, Debug)]
pub enum MqttSessionError {
    #[error("Invalid topic name: {name:?}")]
    InvalidTopic { name: String },

    #[error("Invalid topic filter: {pattern:?}")]
    InvalidFilter { pattern: String },

    #[error("MQTT client error: {0}")]
    ClientError(#[from] rumqttc::ClientError),

    #[error("The connection to the broker has been lost")]
    ConnectionLost,

    #[error("The session has been closed")]
    SessionClosed,

    #[error("No response for request {request_id} within {timeout:?}")]
    RequestTimeout { request_id: u32, timeout: Duration },

    #[error("Request id {request_id} is already awaiting a response")]
    DuplicateRequestId { request_id: u32 },

    #[error("Invalid UTF8 payload: {from}: {input_excerpt}...")]
    InvalidUtf8Payload {
        input_excerpt: String,
        from: std::str::Utf8Error,
    },
}

impl MqttSessionError {
    pub fn new_invalid_utf8_payload(bytes: &[u8], from: std::str::Utf8Error) -> MqttSessionError {
        const EXCERPT_LEN: usize = 80;
        let index = from.valid_up_to();
        let input = std::str::from_utf8(&bytes[..index]).unwrap_or("");

        MqttSessionError::InvalidUtf8Payload {
            input_excerpt: input.chars().take(EXCERPT_LEN).collect(),
            from,
        }
    }
}
