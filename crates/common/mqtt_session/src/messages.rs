use crate::errors::MqttSessionError;
use crate::topics::Topic;
use rumqttc::Publish;
use rumqttc::QoS;

/// A message to be sent to or received from the broker.
///
/// Payloads are opaque bytes: devices speak an encrypted vendor framing that
/// is encoded and decoded by the caller, never here.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MqttMessage {
    pub topic: Topic,
    pub payload: Payload,
    pub qos: QoS,
    pub retain: bool,
}

/// A message payload
pub type Payload = Vec<u8>;

impl MqttMessage {
    pub fn new<B>(topic: &Topic, payload: B) -> MqttMessage
    where
        B: Into<Payload>,
    {
        MqttMessage {
            topic: topic.clone(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    pub fn with_qos(self, qos: QoS) -> Self {
        Self { qos, ..self }
    }

    pub fn with_retain(self) -> Self {
        Self {
            retain: true,
            ..self
        }
    }

    /// The payload as a string, for diagnostics (unless the payload is not UTF8)
    pub fn payload_str(&self) -> Result<&str, MqttSessionError> {
        std::str::from_utf8(&self.payload)
            .map_err(|err| MqttSessionError::new_invalid_utf8_payload(&self.payload, err))
    }
}

impl From<Publish> for MqttMessage {
    fn from(msg: Publish) -> Self {
        let Publish {
            topic,
            payload,
            qos,
            retain,
            ..
        } = msg;

        MqttMessage {
            topic: Topic::new_unchecked(&topic),
            payload: payload.to_vec(),
            qos,
            retain,
        }
    }
}
