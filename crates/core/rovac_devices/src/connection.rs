use crate::channel::DeviceChannel;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::debug;
use log::info;
use rovac_api::Duid;
use rovac_api::RovacError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A connectivity transition of one device, reported to the manager.
///
/// This is the only link from a connection back to the manager: a one-way
/// channel, so that connections never reach into the inventory map.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub duid: Duid,
    pub connected: bool,
    pub error: Option<Arc<RovacError>>,
}

/// Tuning of the per-device retry loop and command deadline.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial interval of the jittered retry backoff
    pub retry_initial_interval: Duration,

    /// Upper bound of the retry backoff
    pub retry_max_interval: Duration,

    /// Deadline applied to `send` calls without an explicit timeout
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            retry_initial_interval: Duration::from_secs(1),
            retry_max_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct PreferredChannel {
    label: &'static str,
    channel: Arc<dyn DeviceChannel>,
}

/// The per-device façade bridging a device to its transports.
///
/// Channels are tried in preference order: a dedicated local transport when
/// the descriptor advertises one, then the shared cloud session. One
/// device's slow or failing channel never blocks another's: every
/// connection retries and sends independently.
#[derive(Clone)]
pub struct DeviceConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    duid: Duid,
    channels: Vec<PreferredChannel>,
    active: Mutex<Option<usize>>,
    last_reported: Mutex<Option<bool>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    request_ids: Arc<AtomicU32>,
    config: ConnectionConfig,
    closed: watch::Sender<bool>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceConnection {
    /// Assemble a connection from its transports, most preferred first.
    ///
    /// `request_ids` is shared across the account so that ids stay unique
    /// among all concurrently outstanding requests of the session.
    pub fn new(
        duid: Duid,
        local: Option<Arc<dyn DeviceChannel>>,
        cloud: Arc<dyn DeviceChannel>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        request_ids: Arc<AtomicU32>,
        config: ConnectionConfig,
    ) -> DeviceConnection {
        let mut channels = Vec::new();
        if let Some(channel) = local {
            channels.push(PreferredChannel {
                label: "local",
                channel,
            });
        }
        channels.push(PreferredChannel {
            label: "cloud",
            channel: cloud,
        });

        let (closed, _) = watch::channel(false);
        DeviceConnection {
            inner: Arc::new(ConnectionInner {
                duid,
                channels,
                active: Mutex::new(None),
                last_reported: Mutex::new(None),
                events,
                request_ids,
                config,
                closed,
                retry_task: Mutex::new(None),
            }),
        }
    }

    /// Begin (or resume) connectivity attempts; idempotent, never blocks.
    pub fn start_connect(&self) {
        if *self.inner.closed.borrow() {
            return;
        }
        let mut task = self.inner.retry_task.lock().unwrap();
        let running = task.as_ref().is_some_and(|task| !task.is_finished());
        if running {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(ConnectionInner::run_retry_loop(inner)));
    }

    /// Send a command body and await the device's response.
    ///
    /// Independent per device: the call is routed over the currently active
    /// channel, falling back to the cloud path when no channel has been
    /// established yet.
    pub async fn send(
        &self,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RovacError> {
        if *self.inner.closed.borrow() {
            return Err(RovacError::Closed);
        }
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        let request_id = self.inner.request_ids.fetch_add(1, Ordering::Relaxed);
        let index = self
            .inner
            .active
            .lock()
            .unwrap()
            .unwrap_or(self.inner.channels.len() - 1);
        let preferred = &self.inner.channels[index];
        preferred.channel.request(request_id, body, timeout).await
    }

    pub fn duid(&self) -> &Duid {
        &self.inner.duid
    }

    pub fn is_connected(&self) -> bool {
        self.inner.active.lock().unwrap().is_some()
    }

    /// Tear down the retry loop and every channel; safe to call repeatedly.
    pub async fn close(&self) {
        if *self.inner.closed.borrow() {
            return;
        }
        // send_replace: the retry loop may not be running, but the flag must
        // still flip for later calls to observe
        let _ = self.inner.closed.send_replace(true);
        for preferred in &self.inner.channels {
            preferred.channel.close().await;
        }
        if let Some(task) = self.inner.retry_task.lock().unwrap().take() {
            task.abort();
        }
        *self.inner.active.lock().unwrap() = None;
    }
}

impl ConnectionInner {
    /// Report a transition, exactly once per actual state change.
    ///
    /// Repeated failed attempts while already disconnected stay silent.
    fn report(&self, connected: bool, error: Option<Arc<RovacError>>) {
        let mut last = self.last_reported.lock().unwrap();
        let unchanged = *last == Some(connected) || (!connected && last.is_none());
        if unchanged {
            return;
        }
        *last = Some(connected);
        let _ = self.events.send(ConnectionEvent {
            duid: self.duid.clone(),
            connected,
            error,
        });
    }

    async fn run_retry_loop(inner: Arc<ConnectionInner>) {
        let mut closed = inner.closed.subscribe();
        let mut backoff = retry_backoff(
            inner.config.retry_initial_interval,
            inner.config.retry_max_interval,
        );

        while !*closed.borrow() {
            match inner.try_connect().await {
                Err(err) => {
                    inner.report(false, Some(Arc::new(err)));
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(inner.config.retry_max_interval);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = closed.changed() => {}
                    }
                }
                Ok(index) => {
                    backoff.reset();
                    *inner.active.lock().unwrap() = Some(index);
                    inner.report(true, None);

                    let preferred = &inner.channels[index];
                    loop {
                        if *closed.borrow() || !preferred.channel.is_alive() {
                            break;
                        }
                        tokio::select! {
                            () = preferred.channel.wait_liveness_change(true) => {}
                            _ = closed.changed() => {}
                        }
                    }

                    *inner.active.lock().unwrap() = None;
                    if !*closed.borrow() {
                        inner.report(
                            false,
                            Some(Arc::new(RovacError::Connectivity {
                                reason: format!("{} transport lost", preferred.label),
                            })),
                        );
                    }
                }
            }
        }
    }

    /// Try every channel once, in preference order.
    async fn try_connect(&self) -> Result<usize, RovacError> {
        let mut last_error = RovacError::Connectivity {
            reason: "no transport available".to_string(),
        };
        for (index, preferred) in self.channels.iter().enumerate() {
            match preferred.channel.connect().await {
                Ok(()) => {
                    info!("Device {} connected over {}", self.duid, preferred.label);
                    return Ok(index);
                }
                Err(err) => {
                    debug!(
                        "Device {}: {} transport attempt failed: {err}",
                        self.duid, preferred.label
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

fn retry_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
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
