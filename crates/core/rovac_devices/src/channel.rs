use async_trait::async_trait;
use log::debug;
use log::warn;
use mqtt_session::MessageCallback;
use mqtt_session::MqttSession;
use mqtt_session::SessionState;
use mqtt_session::SubscriptionHandle;
use mqtt_session::Topic;
use mqtt_session::TopicFilter;
use rovac_api::DeviceDescriptor;
use rovac_api::Duid;
use rovac_api::PayloadCodec;
use rovac_api::RovacError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Mutex;

/// A bidirectional channel to one device.
///
/// Implemented by [`CloudChannel`] over the shared account session, and by
/// local-network transports supplied through a [`LocalTransportFactory`].
#[async_trait]
pub trait DeviceChannel: Send + Sync + 'static {
    /// Open the channel; idempotent.
    ///
    /// An error here means "not reachable right now" and is retried by the
    /// owning device connection.
    async fn connect(&self) -> Result<(), RovacError>;

    /// Send a request body and await the correlated response.
    async fn request(
        &self,
        request_id: u32,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RovacError>;

    /// Current liveness of the underlying transport.
    fn is_alive(&self) -> bool;

    /// Suspend until `is_alive` differs from `current`.
    async fn wait_liveness_change(&self, current: bool);

    /// Tear down the channel; safe to call more than once.
    async fn close(&self);
}

/// Builds dedicated local-network channels.
///
/// The wire protocol of a local connection (hello handshake, framing,
/// encryption) is an external concern: implementations return a ready-made
/// [`DeviceChannel`] when the descriptor carries usable local addressing,
/// and `None` otherwise.
pub trait LocalTransportFactory: Send + Sync + 'static {
    fn create(&self, descriptor: &DeviceDescriptor) -> Option<Arc<dyn DeviceChannel>>;
}

/// The cloud path: a device's topics multiplexed over the shared session.
pub struct CloudChannel {
    duid: Duid,
    session: Arc<MqttSession>,
    codec: Arc<dyn PayloadCodec>,
    /// Topic the device publishes its responses on
    subscribe_topic: String,
    /// Topic the cloud forwards our requests on
    publish_topic: String,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl CloudChannel {
    pub fn new(
        descriptor: &DeviceDescriptor,
        session: Arc<MqttSession>,
        codec: Arc<dyn PayloadCodec>,
    ) -> CloudChannel {
        CloudChannel {
            duid: descriptor.duid.clone(),
            session,
            codec,
            subscribe_topic: descriptor.topic.clone(),
            publish_topic: request_topic(&descriptor.topic),
            subscription: Mutex::new(None),
        }
    }
}

/// Derive the cloud-inbound topic from the device-outbound one.
///
/// Devices respond on `rr/m/o/<user>/<hash>/<duid>` and listen on the same
/// path under `rr/m/i`.
fn request_topic(response_topic: &str) -> String {
    response_topic.replacen("/o/", "/i/", 1)
}

#[async_trait]
impl DeviceChannel for CloudChannel {
    async fn connect(&self) -> Result<(), RovacError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_none() {
            let filter = TopicFilter::new(&self.subscribe_topic)?;
            let completer = self.session.completer();
            let codec = self.codec.clone();
            let duid = self.duid.clone();
            let callback: MessageCallback = Arc::new(move |message| {
                match codec.decode(&message.payload) {
                    Ok(frame) => match frame.request_id {
                        Some(request_id) => {
                            let _ = completer.complete(request_id, frame.body);
                        }
                        // Unsolicited device messages (state pushes) are not
                        // part of the command surface
                        None => debug!("Unsolicited message from {duid}"),
                    },
                    Err(err) => warn!("Undecodable message from {duid}: {err}"),
                }
            });
            *subscription = Some(self.session.subscribe(filter, callback).await?);
        }
        drop(subscription);

        if self.session.is_connected() {
            Ok(())
        } else {
            Err(RovacError::Connectivity {
                reason: "cloud session not connected".to_string(),
            })
        }
    }

    async fn request(
        &self,
        request_id: u32,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RovacError> {
        let encoded = self.codec.encode(request_id, body);
        let topic = Topic::new(&self.publish_topic)?;
        let response = self
            .session
            .request(&topic, request_id, encoded, timeout)
            .await?;
        Ok(response)
    }

    fn is_alive(&self) -> bool {
        self.session.is_connected()
    }

    async fn wait_liveness_change(&self, current: bool) {
        let mut state = self.session.state();
        loop {
            let alive = *state.borrow_and_update() == SessionState::Connected;
            if alive != current {
                return;
            }
            if state.changed().await.is_err() {
                // Session gone for good: report as not alive
                if current {
                    return;
                }
                // Nothing will ever change again; park until cancelled
                std::future::pending::<()>().await;
            }
        }
    }

    async fn close(&self) {
        if let Some(handle) = self.subscription.lock().await.take() {
            if let Err(err) = self.session.unsubscribe(handle).await {
                debug!("Failed to unsubscribe {}: {err}", self.duid);
            }
        }
    }
}

/// A liveness flag for channel implementations that manage their own
/// transport, with the wait semantics [`DeviceChannel`] requires.
pub struct LivenessFlag {
    tx: watch::Sender<bool>,
}

impl Default for LivenessFlag {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        LivenessFlag { tx }
    }
}

impl LivenessFlag {
    pub fn set(&self, alive: bool) {
        // send_replace updates the value even when nobody is waiting
        let _ = self.tx.send_replace(alive);
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait_change(&self, current: bool) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() != current {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
