use crate::channel::CloudChannel;
use crate::channel::DeviceChannel;
use crate::channel::LocalTransportFactory;
use crate::connection::ConnectionConfig;
use crate::connection::ConnectionEvent;
use crate::connection::DeviceConnection;
use clock::Clock;
use clock::WallClock;
use log::info;
use log::warn;
use mqtt_session::MqttSession;
use rovac_api::capabilities;
use rovac_api::AccountClient;
use rovac_api::Cache;
use rovac_api::CapabilityOverride;
use rovac_api::CapabilitySet;
use rovac_api::DeviceDescriptor;
use rovac_api::DeviceLifecycleState;
use rovac_api::Duid;
use rovac_api::InventorySnapshot;
use rovac_api::NoCache;
use rovac_api::PayloadCodec;
use rovac_api::RovacError;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// First id handed out for device commands; lower ids are reserved for
/// transport-internal sentinels.
const FIRST_REQUEST_ID: u32 = 100;

/// Tuning of the device manager.
#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    /// Connect every mapped device automatically.
    ///
    /// When disabled, connection is deferred until
    /// [`DeviceManager::connect_device`] is called, so that disabled devices
    /// do not hold idle connections.
    ///
    /// Default: `true`
    pub auto_connect: bool,

    /// Interval between two inventory refreshes
    ///
    /// Default: 60s
    pub reconcile_interval: Duration,

    /// Consecutive refreshes a device must be missing from before it is
    /// removed; a single miss is treated as an API blip
    ///
    /// Default: 2
    pub missing_refreshes_before_removal: u8,

    /// Per-device retry and command-deadline tuning
    pub connection: ConnectionConfig,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        DeviceManagerConfig {
            auto_connect: true,
            reconcile_interval: Duration::from_secs(60),
            missing_refreshes_before_removal: 2,
            connection: ConnectionConfig::default(),
        }
    }
}

impl DeviceManagerConfig {
    pub fn with_auto_connect(self, auto_connect: bool) -> Self {
        Self {
            auto_connect,
            ..self
        }
    }

    pub fn with_reconcile_interval(self, reconcile_interval: Duration) -> Self {
        Self {
            reconcile_interval,
            ..self
        }
    }

    pub fn with_missing_refreshes_before_removal(self, count: u8) -> Self {
        Self {
            missing_refreshes_before_removal: count,
            ..self
        }
    }

    pub fn with_connection(self, connection: ConnectionConfig) -> Self {
        Self { connection, ..self }
    }
}

/// A device lifecycle notification delivered to registered listeners.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub duid: Duid,
    pub state: DeviceLifecycleState,

    /// Set when the device reached `Mapped` or its capabilities changed
    pub capabilities: Option<CapabilitySet>,

    /// The failure behind a degraded transition, when there is one
    pub last_error: Option<Arc<RovacError>>,
}

/// Listener callbacks must be fast and non-blocking: they are invoked on the
/// manager's own tasks, in per-device transition order.
pub type DeviceListener = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// An opaque handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

#[derive(Default)]
struct ListenerRegistry {
    entries: std::sync::Mutex<Vec<(u64, DeviceListener)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn add(&self, listener: DeviceListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push((id, listener));
        ListenerHandle(id)
    }

    fn remove(&self, handle: ListenerHandle) {
        self.entries
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    fn notify(&self, event: &DeviceEvent) {
        let listeners: Vec<DeviceListener> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().map(|(_, listener)| listener.clone()).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}

/// A point-in-time view over one managed device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub duid: Duid,
    pub name: String,
    pub model: String,
    pub state: DeviceLifecycleState,
    pub capabilities: CapabilitySet,
}

struct ManagedDevice {
    descriptor: DeviceDescriptor,
    capabilities: CapabilitySet,
    state: DeviceLifecycleState,
    connection: DeviceConnection,
    missing_refreshes: u8,
}

struct ManagerInner {
    config: DeviceManagerConfig,
    account: Arc<dyn AccountClient>,
    cache: Arc<dyn Cache>,
    session: Arc<MqttSession>,
    codec: Arc<dyn PayloadCodec>,
    local_transports: Option<Arc<dyn LocalTransportFactory>>,
    clock: Arc<dyn Clock>,
    devices: Mutex<HashMap<Duid, ManagedDevice>>,
    listeners: ListenerRegistry,
    request_ids: Arc<AtomicU32>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
}

/// Assembles a [`DeviceManager`] from its collaborators.
pub struct DeviceManagerBuilder {
    config: DeviceManagerConfig,
    account: Arc<dyn AccountClient>,
    cache: Arc<dyn Cache>,
    session: Arc<MqttSession>,
    codec: Arc<dyn PayloadCodec>,
    local_transports: Option<Arc<dyn LocalTransportFactory>>,
    clock: Arc<dyn Clock>,
}

impl DeviceManagerBuilder {
    pub fn new(
        account: Arc<dyn AccountClient>,
        session: Arc<MqttSession>,
        codec: Arc<dyn PayloadCodec>,
    ) -> DeviceManagerBuilder {
        DeviceManagerBuilder {
            config: DeviceManagerConfig::default(),
            account,
            cache: Arc::new(NoCache),
            session,
            codec,
            local_transports: None,
            clock: Arc::new(WallClock),
        }
    }

    pub fn with_config(self, config: DeviceManagerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_cache(self, cache: Arc<dyn Cache>) -> Self {
        Self { cache, ..self }
    }

    pub fn with_local_transports(self, factory: Arc<dyn LocalTransportFactory>) -> Self {
        Self {
            local_transports: Some(factory),
            ..self
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    pub fn build(self) -> DeviceManager {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config: self.config,
            account: self.account,
            cache: self.cache,
            session: self.session,
            codec: self.codec,
            local_transports: self.local_transports,
            clock: self.clock,
            devices: Mutex::new(HashMap::new()),
            listeners: ListenerRegistry::default(),
            request_ids: Arc::new(AtomicU32::new(FIRST_REQUEST_ID)),
            events_tx,
            closed: AtomicBool::new(false),
        });

        let event_pump = tokio::spawn(ManagerInner::run_event_pump(inner.clone(), events_rx));

        DeviceManager {
            inner,
            reconcile_task: std::sync::Mutex::new(None),
            event_pump: std::sync::Mutex::new(Some(event_pump)),
        }
    }
}

/// The fleet orchestrator.
///
/// Owns the inventory and the lifecycle of every device connection, and it
/// takes over the lifecycle of the account session it was built with:
/// [`DeviceManager::close`] closes the session too.
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
    reconcile_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    event_pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    pub fn builder(
        account: Arc<dyn AccountClient>,
        session: Arc<MqttSession>,
        codec: Arc<dyn PayloadCodec>,
    ) -> DeviceManagerBuilder {
        DeviceManagerBuilder::new(account, session, codec)
    }

    /// Populate the inventory from the cache and start background
    /// reconciliation.
    ///
    /// Never touches the network: with no cached snapshot this yields an
    /// empty inventory and schedules an immediate background refresh. Every
    /// cached device is mapped and announced as ready before any connection
    /// attempt is made.
    pub async fn load(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let running = self.reconcile_task.lock().unwrap();
            if running.as_ref().is_some_and(|task| !task.is_finished()) {
                return;
            }
        }

        let cached = match self.inner.cache.load_inventory().await {
            Ok(found) => found,
            Err(err) => {
                warn!("Ignoring unreadable inventory cache: {err}");
                None
            }
        };
        let immediate_refresh = cached.is_none();
        let snapshot =
            cached.unwrap_or_else(|| InventorySnapshot::empty(self.inner.clock.now()));

        info!("Loaded {} device(s) from the cache", snapshot.len());
        self.inner.reconcile(snapshot).await;

        let reconciliation = tokio::spawn(ManagerInner::run_reconciliation(
            self.inner.clone(),
            immediate_refresh,
        ));
        *self.reconcile_task.lock().unwrap() = Some(reconciliation);
    }

    /// Register a lifecycle listener; the handle unsubscribes it.
    pub fn add_listener(&self, listener: DeviceListener) -> ListenerHandle {
        self.inner.listeners.add(listener)
    }

    /// Unsubscribe a listener; idempotent.
    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.inner.listeners.remove(handle);
    }

    /// The current view over every managed device.
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let devices = self.inner.devices.lock().await;
        devices
            .values()
            .map(|device| DeviceInfo {
                duid: device.descriptor.duid.clone(),
                name: device.descriptor.name.clone(),
                model: device.descriptor.model.clone(),
                state: device.state,
                capabilities: device.capabilities.clone(),
            })
            .collect()
    }

    /// Begin connecting one device; used when `auto_connect` is disabled.
    pub async fn connect_device(&self, duid: &Duid) -> Result<(), RovacError> {
        let devices = self.inner.devices.lock().await;
        let device = devices.get(duid).ok_or_else(|| RovacError::UnknownDevice {
            duid: duid.to_string(),
        })?;
        device.connection.start_connect();
        Ok(())
    }

    /// Send an opaque command to one device and await its response.
    ///
    /// Failures surface to this caller only; other in-flight commands and
    /// other devices are unaffected.
    pub async fn send(
        &self,
        duid: &Duid,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RovacError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RovacError::Closed);
        }
        let connection = {
            let devices = self.inner.devices.lock().await;
            devices
                .get(duid)
                .map(|device| device.connection.clone())
                .ok_or_else(|| RovacError::UnknownDevice {
                    duid: duid.to_string(),
                })?
        };
        connection.send(body, timeout).await
    }

    /// Record capabilities discovered by a live probe.
    ///
    /// The override is persisted keyed to the device's current firmware and
    /// OR-merged into the static computation; listeners see an updated
    /// `device_ready` notification when the merge changes anything.
    pub async fn record_override(
        &self,
        duid: &Duid,
        probed: CapabilityOverride,
    ) -> Result<(), RovacError> {
        if let Err(err) = self.inner.cache.store_override(duid, &probed).await {
            warn!("Failed to persist capability override for {duid}: {err}");
        }

        let mut devices = self.inner.devices.lock().await;
        let device = devices.get_mut(duid).ok_or_else(|| RovacError::UnknownDevice {
            duid: duid.to_string(),
        })?;
        let merged = capabilities::compute(&device.descriptor, Some(&probed));
        if merged != device.capabilities {
            device.capabilities = merged.clone();
            self.inner
                .notify(duid, device.state, Some(merged), None);
        }
        Ok(())
    }

    /// Cancel reconciliation, close every device connection and the account
    /// session. In-flight requests resolve immediately with a cancellation
    /// failure. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing the device manager");
        if let Some(task) = self.reconcile_task.lock().unwrap().take() {
            task.abort();
        }

        let connections: Vec<DeviceConnection> = {
            let devices = self.inner.devices.lock().await;
            devices
                .values()
                .map(|device| device.connection.clone())
                .collect()
        };
        for connection in connections {
            connection.close().await;
        }

        self.inner.session.close().await;

        if let Some(task) = self.event_pump.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl ManagerInner {
    /// Reconcile the inventory against a fresh snapshot.
    ///
    /// New devices are mapped and announced without disrupting existing
    /// ones; devices missing from consecutive snapshots are debounced and
    /// eventually removed; changed descriptors get their capabilities
    /// recomputed while connectivity is preserved.
    async fn reconcile(&self, snapshot: InventorySnapshot) {
        let overrides = self.load_overrides(&snapshot).await;

        let mut devices = self.devices.lock().await;

        for descriptor in snapshot.devices() {
            match devices.get_mut(&descriptor.duid) {
                None => {
                    let device = self.register_device(descriptor, overrides.get(&descriptor.duid));
                    let _ = devices.insert(descriptor.duid.clone(), device);
                }
                Some(existing) => {
                    existing.missing_refreshes = 0;
                    if existing.descriptor != *descriptor {
                        self.refresh_device(existing, descriptor, overrides.get(&descriptor.duid));
                    }
                }
            }
        }

        // Debounced removal: a device must be absent from two consecutive
        // refreshes before it is torn down
        let mut orphaned: Vec<Duid> = Vec::new();
        for (duid, device) in devices.iter_mut() {
            if snapshot.contains(duid) {
                continue;
            }
            device.missing_refreshes = device.missing_refreshes.saturating_add(1);
            if device.missing_refreshes >= self.config.missing_refreshes_before_removal {
                orphaned.push(duid.clone());
            }
        }
        for duid in orphaned {
            if let Some(device) = devices.remove(&duid) {
                info!("Device {duid} disappeared from the inventory, removing it");
                device.connection.close().await;
                self.notify(&duid, DeviceLifecycleState::Removed, None, None);
            }
        }
    }

    /// Map a newly discovered device: compute capabilities, announce it as
    /// ready, and optionally begin connecting. The `device_ready`
    /// notification fires whether or not a connection ever succeeds.
    fn register_device(
        &self,
        descriptor: &DeviceDescriptor,
        probed: Option<&CapabilityOverride>,
    ) -> ManagedDevice {
        let capabilities = capabilities::compute(descriptor, probed);
        let connection = self.create_connection(descriptor);

        // Capability computation is pure and total, so a discovered device
        // maps immediately
        let state = DeviceLifecycleState::Mapped;

        info!(
            "Device {} ({}, {:?}) mapped with {} capabilities",
            descriptor.duid,
            descriptor.name,
            descriptor.device_version(),
            capabilities.len()
        );
        self.notify(&descriptor.duid, state, Some(capabilities.clone()), None);

        if self.config.auto_connect {
            connection.start_connect();
        }

        ManagedDevice {
            descriptor: descriptor.clone(),
            capabilities,
            state,
            connection,
            missing_refreshes: 0,
        }
    }

    /// Apply a changed descriptor: recompute capabilities, re-announce on
    /// change, and leave the connectivity state untouched.
    fn refresh_device(
        &self,
        existing: &mut ManagedDevice,
        descriptor: &DeviceDescriptor,
        probed: Option<&CapabilityOverride>,
    ) {
        let capabilities = capabilities::compute(descriptor, probed);
        existing.descriptor = descriptor.clone();
        if capabilities != existing.capabilities {
            info!("Capabilities of {} changed, re-announcing", descriptor.duid);
            existing.capabilities = capabilities.clone();
            self.notify(&descriptor.duid, existing.state, Some(capabilities), None);
        }
    }

    fn create_connection(&self, descriptor: &DeviceDescriptor) -> DeviceConnection {
        let local: Option<Arc<dyn DeviceChannel>> = match &descriptor.local_network {
            Some(_) => self
                .local_transports
                .as_ref()
                .and_then(|factory| factory.create(descriptor)),
            None => None,
        };
        let cloud: Arc<dyn DeviceChannel> = Arc::new(CloudChannel::new(
            descriptor,
            self.session.clone(),
            self.codec.clone(),
        ));
        DeviceConnection::new(
            descriptor.duid.clone(),
            local,
            cloud,
            self.events_tx.clone(),
            self.request_ids.clone(),
            self.config.connection.clone(),
        )
    }

    async fn load_overrides(
        &self,
        snapshot: &InventorySnapshot,
    ) -> HashMap<Duid, CapabilityOverride> {
        let mut overrides = HashMap::new();
        for descriptor in snapshot.devices() {
            match self.cache.load_override(&descriptor.duid).await {
                Ok(Some(probed)) => {
                    let _ = overrides.insert(descriptor.duid.clone(), probed);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        "Ignoring unreadable capability override for {}: {err}",
                        descriptor.duid
                    );
                }
            }
        }
        overrides
    }

    fn notify(
        &self,
        duid: &Duid,
        state: DeviceLifecycleState,
        capabilities: Option<CapabilitySet>,
        last_error: Option<Arc<RovacError>>,
    ) {
        let event = DeviceEvent {
            duid: duid.clone(),
            state,
            capabilities,
            last_error,
        };
        self.listeners.notify(&event);
    }

    /// Forward connectivity transitions from the device connections to the
    /// listeners, serialized so that per-device ordering is preserved.
    async fn run_event_pump(
        inner: Arc<ManagerInner>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let mut devices = inner.devices.lock().await;
            let Some(device) = devices.get_mut(&event.duid) else {
                continue;
            };
            let next = if event.connected {
                DeviceLifecycleState::Connected
            } else {
                DeviceLifecycleState::Disconnected
            };
            if device.state.can_transition_to(next) {
                device.state = next;
                inner.notify(&event.duid, next, None, event.error);
            }
        }
    }

    /// Periodically re-fetch the inventory. Refresh failures are swallowed:
    /// the previous snapshot stays authoritative and the fetch is retried on
    /// the next tick.
    async fn run_reconciliation(inner: Arc<ManagerInner>, immediate_first: bool) {
        let period = inner.config.reconcile_interval;
        let first_tick = if immediate_first {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + period
        };
        let mut ticks = tokio::time::interval_at(first_tick, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let _ = ticks.tick().await;
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            match inner.account.fetch_inventory().await {
                Ok(snapshot) => {
                    if let Err(err) = inner.cache.store_inventory(&snapshot).await {
                        warn!("Failed to cache the refreshed inventory: {err}");
                    }
                    inner.reconcile(snapshot).await;
                }
                Err(err) => {
                    warn!("Inventory refresh failed, keeping the previous snapshot: {err}");
                }
            }
        }
    }
}
