use std::time::Duration;

/// Configuration of the account-level MQTT session
#[derive(Debug, Clone)]
pub struct MqttSessionConfig {
    /// Broker host to connect to
    ///
    /// Default: "localhost"
    pub host: String,

    /// Broker port to connect to. Usually 1883 for insecure MQTT and
    /// 8883 for secure MQTT.
    ///
    /// Default: 1883
    pub port: u16,

    /// The session name used as the MQTT client id
    ///
    /// If no session name is provided, a random one is generated and the
    /// session is clean on connect.
    ///
    /// Default: None
    pub session_name: Option<String>,

    /// Broker credentials
    ///
    /// Default: None
    pub credentials: Option<Credentials>,

    /// Clean the MQTT session upon connect if set to `true`.
    ///
    /// Default: `false`
    pub clean_session: bool,

    /// Capacity of the internal request queues
    ///
    /// Default: `1024`
    pub queue_capacity: usize,

    /// Maximum size for a message payload
    ///
    /// Default: `1024 * 1024`
    pub max_packet_size: usize,

    /// Initial interval of the reconnect backoff
    ///
    /// Default: 1s
    pub reconnect_initial_interval: Duration,

    /// Upper bound of the reconnect backoff
    ///
    /// Default: 60s
    pub reconnect_max_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for MqttSessionConfig {
    fn default() -> Self {
        MqttSessionConfig {
            host: String::from("localhost"),
            port: 1883,
            session_name: None,
            credentials: None,
            clean_session: false,
            queue_capacity: 1024,
            max_packet_size: 1024 * 1024,
            reconnect_initial_interval: Duration::from_secs(1),
            reconnect_max_interval: Duration::from_secs(60),
        }
    }
}

impl MqttSessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..MqttSessionConfig::default()
        }
    }

    /// Set a custom host
    pub fn with_host(self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self
        }
    }

    /// Set a custom port
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    /// Set the session name
    pub fn with_session_name(self, name: impl Into<String>) -> Self {
        Self {
            session_name: Some(name.into()),
            ..self
        }
    }

    /// Set the broker credentials
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some(Credentials {
                username: username.into(),
                password: password.into(),
            }),
            ..self
        }
    }

    /// Set the clean_session flag
    pub fn with_clean_session(self, flag: bool) -> Self {
        Self {
            clean_session: flag,
            ..self
        }
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    /// Set the maximum size for a message payload
    pub fn with_max_packet_size(self, max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            ..self
        }
    }

    /// Bound the reconnect backoff
    pub fn with_reconnect_intervals(self, initial: Duration, max: Duration) -> Self {
        Self {
            reconnect_initial_interval: initial,
            reconnect_max_interval: max,
            ..self
        }
    }

    /// Wrap this config into an internal set of options for `rumqttc`.
    pub(crate) fn mqtt_options(&self) -> rumqttc::MqttOptions {
        let id = match &self.session_name {
            None => std::iter::repeat_with(fastrand::lowercase)
                .take(10)
                .collect(),
            Some(name) => name.clone(),
        };

        let mut mqtt_options = rumqttc::MqttOptions::new(id, &self.host, self.port);

        if self.session_name.is_none() {
            // There is no point to have a session with a random name that will not be reused.
            mqtt_options.set_clean_session(true);
        } else {
            mqtt_options.set_clean_session(self.clean_session);
        }

        if let Some(credentials) = &self.credentials {
            mqtt_options.set_credentials(&credentials.username, &credentials.password);
        }

        mqtt_options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        mqtt_options
    }
}
