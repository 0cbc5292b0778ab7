use crate::errors::MqttSessionError;
use crate::MqttMessage;
use rumqttc::QoS;
use rumqttc::SubscribeFilter;

/// An MQTT topic
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Topic {
    pub name: String,
}

impl Topic {
    /// Check if the topic name is valid and build a new topic.
    pub fn new(name: &str) -> Result<Topic, MqttSessionError> {
        let name = String::from(name);
        if rumqttc::valid_topic(&name) {
            Ok(Topic { name })
        } else {
            Err(MqttSessionError::InvalidTopic { name })
        }
    }

    /// Build a new topic, assuming the name is valid
    pub fn new_unchecked(name: &str) -> Topic {
        let name = String::from(name);
        Topic { name }
    }

    /// Build a topic filter filtering only that topic
    pub fn filter(&self) -> TopicFilter {
        TopicFilter {
            pattern: self.name.clone(),
            qos: QoS::AtLeastOnce,
        }
    }
}

/// An MQTT topic filter
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicFilter {
    pub pattern: String,
    pub qos: QoS,
}

impl TopicFilter {
    /// Check if the pattern is valid and build a new topic filter.
    pub fn new(pattern: &str) -> Result<TopicFilter, MqttSessionError> {
        let pattern = String::from(pattern);
        if rumqttc::valid_filter(&pattern) {
            Ok(TopicFilter {
                pattern,
                qos: QoS::AtLeastOnce,
            })
        } else {
            Err(MqttSessionError::InvalidFilter { pattern })
        }
    }

    /// Build a new topic filter, assuming the pattern is valid.
    pub fn new_unchecked(pattern: &str) -> TopicFilter {
        TopicFilter {
            pattern: String::from(pattern),
            qos: QoS::AtLeastOnce,
        }
    }

    /// Check if the given topic matches this filter pattern.
    pub fn accept_topic(&self, topic: &Topic) -> bool {
        rumqttc::matches(&topic.name, &self.pattern)
    }

    /// Check if the given message matches this filter pattern.
    pub fn accept(&self, msg: &MqttMessage) -> bool {
        self.accept_topic(&msg.topic)
    }

    /// This topic filter with the given QoS
    pub fn with_qos(self, qos: QoS) -> Self {
        Self { qos, ..self }
    }

    /// The `SubscribeFilter` expected by `rumqttc`
    pub(crate) fn subscribe_filter(&self) -> SubscribeFilter {
        SubscribeFilter {
            path: self.pattern.clone(),
            qos: self.qos,
        }
    }
}

impl TryFrom<&str> for Topic {
    type Error = MqttSessionError;

    fn try_from(name: &str) -> Result<Topic, Self::Error> {
        Topic::new(name)
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> TopicFilter {
        topic.filter()
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = MqttSessionError;

    fn try_from(pattern: &str) -> Result<TopicFilter, Self::Error> {
        TopicFilter::new(pattern)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.name
    }
}
