use crate::config::MqttSessionConfig;
use crate::errors::MqttSessionError;
use crate::messages::MqttMessage;
use crate::messages::Payload;
use crate::requests::RequestRegistry;
use crate::subscriptions::MessageCallback;
use crate::subscriptions::SubscriptionHandle;
use crate::subscriptions::SubscriptionStore;
use crate::topics::Topic;
use crate::topics::TopicFilter;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::debug;
use log::error;
use log::info;
use log::warn;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use rumqttc::SubscribeFilter;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Liveness of the underlying broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not currently connected; the session keeps retrying in the background.
    Disconnected,
    Connected,
    /// Closed for good; the session will never reconnect.
    Closed,
}

/// A persistent connection to the account's MQTT broker.
///
/// There is exactly one session per account connection target; devices share
/// it, multiplexed by topic.
pub struct MqttSession {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionStore>,
    requests: Arc<RequestRegistry>,
    state_rx: watch::Receiver<SessionState>,
    closed: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl MqttSession {
    /// Start the session.
    ///
    /// This spawns the connection task and returns at once: establishment
    /// happens in the background and is observable via [`MqttSession::state`].
    pub fn connect(config: &MqttSessionConfig) -> MqttSession {
        let mqtt_options = config.mqtt_options();
        let (client, event_loop) = AsyncClient::new(mqtt_options, config.queue_capacity);

        let subscriptions = Arc::new(SubscriptionStore::default());
        let requests = Arc::new(RequestRegistry::default());
        let closed = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let event_loop = tokio::spawn(MqttSession::run_event_loop(
            event_loop,
            client.clone(),
            subscriptions.clone(),
            requests.clone(),
            state_tx,
            closed.clone(),
            config.reconnect_initial_interval,
            config.reconnect_max_interval,
        ));

        MqttSession {
            client,
            subscriptions,
            requests,
            state_rx,
            closed,
            event_loop,
        }
    }

    /// A watch channel following the connection state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == SessionState::Connected
    }

    /// Register a callback for inbound messages matching the filter.
    ///
    /// All the callbacks registered on a topic are invoked, in registration
    /// order, for each message. The subscription survives reconnections and
    /// is only dropped by [`MqttSession::unsubscribe`] or
    /// [`MqttSession::close`].
    pub async fn subscribe(
        &self,
        filter: TopicFilter,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, MqttSessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqttSessionError::SessionClosed);
        }
        let pattern = filter.pattern.clone();
        let qos = filter.qos;
        let handle = self.subscriptions.insert(filter, callback);
        self.client.subscribe(pattern, qos).await?;
        Ok(handle)
    }

    /// Remove a callback; idempotent.
    ///
    /// The broker subscription itself is only dropped once no registered
    /// callback covers the topic anymore.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), MqttSessionError> {
        if let Some(filter) = self.subscriptions.remove(handle) {
            if !self.subscriptions.covers(&filter.pattern) {
                self.client.unsubscribe(filter.pattern).await?;
            }
        }
        Ok(())
    }

    /// Publish a payload without awaiting any response.
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: impl Into<Payload>,
    ) -> Result<(), MqttSessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqttSessionError::SessionClosed);
        }
        self.client
            .publish(topic.name.clone(), QoS::AtLeastOnce, false, payload.into())
            .await?;
        Ok(())
    }

    /// Publish a payload and suspend until the correlated response arrives.
    ///
    /// The caller's codec layer is responsible for routing inbound responses
    /// back through [`MqttSession::complete_request`] with the same id. On
    /// timeout the pending entry is removed: a later response carrying a
    /// reused id cannot resolve this caller anymore.
    pub async fn request(
        &self,
        topic: &Topic,
        request_id: u32,
        payload: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Payload, MqttSessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqttSessionError::SessionClosed);
        }

        let receiver = self.requests.insert(request_id)?;
        if let Err(err) = self
            .client
            .publish(topic.name.clone(), QoS::AtLeastOnce, false, payload.into())
            .await
        {
            self.requests.remove(request_id);
            return Err(err.into());
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            // The registry was dropped whole, which only happens on close
            Ok(Err(_)) => Err(MqttSessionError::SessionClosed),
            Err(_) => {
                self.requests.remove(request_id);
                Err(MqttSessionError::RequestTimeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Resolve the request waiting on `request_id` with a response payload.
    ///
    /// Returns false when no caller is waiting anymore.
    pub fn complete_request(&self, request_id: u32, response: Payload) -> bool {
        self.requests.complete(request_id, response)
    }

    /// A standalone handle resolving pending requests.
    ///
    /// Subscription callbacks decode inbound frames and resolve the waiting
    /// requests through this handle; holding it does not keep the session
    /// alive.
    pub fn completer(&self) -> RequestCompleter {
        RequestCompleter {
            requests: self.requests.clone(),
        }
    }

    /// Tear down the session for good.
    ///
    /// Every outstanding request is unblocked with
    /// [`MqttSessionError::SessionClosed`] and all subscriptions are cleared.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing the MQTT session");
        self.requests.fail_all(|| MqttSessionError::SessionClosed);
        self.subscriptions.clear();
        let _ = self.client.disconnect().await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        subscriptions: Arc<SubscriptionStore>,
        requests: Arc<RequestRegistry>,
        state_tx: watch::Sender<SessionState>,
        closed: Arc<AtomicBool>,
        reconnect_initial_interval: Duration,
        reconnect_max_interval: Duration,
    ) {
        let mut reconnect_backoff =
            MqttSession::reconnect_backoff(reconnect_initial_interval, reconnect_max_interval);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to the MQTT broker");
                    reconnect_backoff.reset();
                    let _ = state_tx.send(SessionState::Connected);

                    // Re-establish the subscriptions the broker may have lost
                    let filters: Vec<SubscribeFilter> = subscriptions
                        .patterns()
                        .iter()
                        .map(TopicFilter::subscribe_filter)
                        .collect();
                    if !filters.is_empty() {
                        if let Err(err) = client.subscribe_many(filters).await {
                            error!("Failed to restore the subscriptions: {err}");
                        }
                    }
                }

                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    subscriptions.dispatch(&MqttMessage::from(publish));
                }

                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                }

                Ok(_) => (),

                Err(err) => {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if *state_tx.borrow() == SessionState::Connected {
                        warn!("MQTT connection lost: {err}");
                        let _ = state_tx.send(SessionState::Disconnected);
                        // Exactly-once delivery cannot be guaranteed across a
                        // reconnect, so pending requests fail rather than retry.
                        requests.fail_all(|| MqttSessionError::ConnectionLost);
                    }
                    let delay = reconnect_backoff
                        .next_backoff()
                        .unwrap_or(reconnect_max_interval);
                    debug!("Next connection attempt in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let _ = state_tx.send(SessionState::Closed);
    }

    fn reconnect_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: max,
            max_elapsed_time: None,
            randomization_factor: 0.5,
            multiplier: 2.0,
            ..Default::default()
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// Resolves pending requests with their correlated responses.
#[derive(Clone)]
pub struct RequestCompleter {
    requests: Arc<RequestRegistry>,
}

impl RequestCompleter {
    /// Resolve the request waiting on `request_id`.
    ///
    /// Returns false when no caller is waiting anymore.
    pub fn complete(&self, request_id: u32, response: Payload) -> bool {
        self.requests.complete(request_id, response)
    }
}
