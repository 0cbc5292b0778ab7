use crate::*;
use async_trait::async_trait;
use mqtt_session::MqttSession;
use mqtt_session::MqttSessionConfig;
use rovac_api::AccountClient;
use rovac_api::Cache;
use rovac_api::Capability;
use rovac_api::CapabilityOverride;
use rovac_api::DecodedFrame;
use rovac_api::DeviceDescriptor;
use rovac_api::DeviceLifecycleState;
use rovac_api::Duid;
use rovac_api::InMemoryCache;
use rovac_api::InventorySnapshot;
use rovac_api::NetworkInfo;
use rovac_api::PayloadCodec;
use rovac_api::RovacError;
use assert_matches::assert_matches;
use chrono::Utc;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const RECONCILE_INTERVAL: Duration = Duration::from_millis(30);
const WAIT: Duration = Duration::from_secs(2);

fn descriptor(duid: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        duid: duid.into(),
        name: format!("Roborock {duid}"),
        model: "roborock.vacuum.a27".into(),
        firmware_version: "02.16.12".into(),
        protocol_version: "1.0".into(),
        feature_flags: 0,
        feature_flags_hex: String::new(),
        feature_ids: vec![],
        product_tags: Default::default(),
        topic: format!("rr/m/o/user123/19648f94/{duid}"),
        local_network: Some(NetworkInfo {
            ip: "192.168.1.10".into(),
            ssid: None,
            mac: None,
            rssi: None,
        }),
    }
}

fn snapshot(devices: Vec<DeviceDescriptor>) -> InventorySnapshot {
    InventorySnapshot::new(Utc::now(), devices)
}

/// Scripted account collaborator: pops one snapshot per fetch, then fails
/// with a connectivity error once the script is exhausted.
#[derive(Default)]
struct FakeAccount {
    responses: Mutex<VecDeque<InventorySnapshot>>,
    calls: AtomicUsize,
}

impl FakeAccount {
    fn push(&self, snapshot: InventorySnapshot) {
        self.responses.lock().unwrap().push_back(snapshot);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountClient for FakeAccount {
    async fn fetch_inventory(&self) -> Result<InventorySnapshot, RovacError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RovacError::Connectivity {
                reason: "account unreachable".to_string(),
            })
    }
}

/// A controllable device channel standing in for a local transport.
struct FakeChannel {
    liveness: LivenessFlag,
    connectable: AtomicBool,
    responses: Mutex<VecDeque<Vec<u8>>>,
    requests: Mutex<Vec<Vec<u8>>>,
}

impl FakeChannel {
    fn new(connectable: bool) -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            liveness: LivenessFlag::default(),
            connectable: AtomicBool::new(connectable),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn push_response(&self, response: &[u8]) {
        self.responses.lock().unwrap().push_back(response.to_vec());
    }

    fn drop_connection(&self) {
        self.liveness.set(false);
    }
}

#[async_trait]
impl DeviceChannel for FakeChannel {
    async fn connect(&self) -> Result<(), RovacError> {
        if self.connectable.load(Ordering::SeqCst) {
            self.liveness.set(true);
            Ok(())
        } else {
            Err(RovacError::Connectivity {
                reason: "device unreachable".to_string(),
            })
        }
    }

    async fn request(
        &self,
        _request_id: u32,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RovacError> {
        self.requests.lock().unwrap().push(body.to_vec());
        let scripted = self.responses.lock().unwrap().pop_front();
        match scripted {
            Some(response) => Ok(response),
            None => {
                tokio::time::sleep(timeout).await;
                Err(RovacError::RequestTimeout { timeout })
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.liveness.get()
    }

    async fn wait_liveness_change(&self, current: bool) {
        self.liveness.wait_change(current).await
    }

    async fn close(&self) {
        self.liveness.set(false);
    }
}

#[derive(Default)]
struct FakeTransports {
    channels: Mutex<HashMap<Duid, Arc<FakeChannel>>>,
}

impl FakeTransports {
    fn provide(&self, duid: &str, channel: Arc<FakeChannel>) {
        let _ = self.channels.lock().unwrap().insert(duid.into(), channel);
    }
}

impl LocalTransportFactory for FakeTransports {
    fn create(&self, descriptor: &DeviceDescriptor) -> Option<Arc<dyn DeviceChannel>> {
        self.channels
            .lock()
            .unwrap()
            .get(&descriptor.duid)
            .map(|channel| channel.clone() as Arc<dyn DeviceChannel>)
    }
}

/// Passthrough codec: the cloud path is present but unexercised here.
struct NoopCodec;

impl PayloadCodec for NoopCodec {
    fn encode(&self, _request_id: u32, body: &[u8]) -> Vec<u8> {
        body.to_vec()
    }

    fn decode(&self, raw: &[u8]) -> Result<DecodedFrame, RovacError> {
        Ok(DecodedFrame {
            request_id: None,
            body: raw.to_vec(),
        })
    }
}

#[derive(Clone, Default)]
struct EventRecorder {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
}

impl EventRecorder {
    fn listener(&self) -> DeviceListener {
        let events = self.events.clone();
        Arc::new(move |event| events.lock().unwrap().push(event.clone()))
    }

    fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().unwrap().clone()
    }

    fn states_of(&self, duid: &Duid) -> Vec<DeviceLifecycleState> {
        self.events()
            .iter()
            .filter(|event| &event.duid == duid)
            .map(|event| event.state)
            .collect()
    }

    async fn wait_until(&self, predicate: impl Fn(&[DeviceEvent]) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if predicate(&self.events()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within {WAIT:?}; events so far: {:?}",
                self.events()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_state(&self, duid: &Duid, state: DeviceLifecycleState) {
        let duid = duid.clone();
        self.wait_until(move |events| {
            events
                .iter()
                .any(|event| event.duid == duid && event.state == state)
        })
        .await;
    }
}

struct Fixture {
    manager: DeviceManager,
    account: Arc<FakeAccount>,
    cache: Arc<InMemoryCache>,
    transports: Arc<FakeTransports>,
    events: EventRecorder,
}

fn fixture(config: DeviceManagerConfig) -> Fixture {
    let account = Arc::new(FakeAccount::default());
    let cache = Arc::new(InMemoryCache::default());
    let transports = Arc::new(FakeTransports::default());
    let events = EventRecorder::default();

    // Nothing listens on this port: the cloud path stays dark and devices
    // are reached over the fake local transports
    let session_config = MqttSessionConfig::new("127.0.0.1", 18884)
        .with_reconnect_intervals(Duration::from_secs(5), Duration::from_secs(60));
    let session = Arc::new(MqttSession::connect(&session_config));

    let manager = DeviceManager::builder(account.clone(), session, Arc::new(NoopCodec))
        .with_config(config)
        .with_cache(cache.clone())
        .with_local_transports(transports.clone())
        .build();
    let _ = manager.add_listener(events.listener());

    Fixture {
        manager,
        account,
        cache,
        transports,
        events,
    }
}

fn test_config() -> DeviceManagerConfig {
    DeviceManagerConfig::default()
        .with_reconcile_interval(RECONCILE_INTERVAL)
        .with_connection(ConnectionConfig {
            retry_initial_interval: Duration::from_millis(10),
            retry_max_interval: Duration::from_millis(100),
            request_timeout: Duration::from_millis(500),
        })
}

#[tokio::test]
async fn first_run_without_cache_or_account_yields_an_empty_inventory() {
    let fixture = fixture(test_config());

    // Given no cache and an unreachable account, load still returns promptly
    tokio::time::timeout(Duration::from_secs(1), fixture.manager.load())
        .await
        .expect("load must not block on the network");

    assert!(fixture.manager.devices().await.is_empty());
    fixture.manager.close().await;
}

#[tokio::test]
async fn cached_devices_are_announced_ready_even_while_unreachable() {
    let fixture = fixture(test_config());
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    // The device cannot be connected to
    fixture
        .transports
        .provide("abc123", FakeChannel::new(false));

    fixture.manager.load().await;

    // device_ready fires regardless of connectivity
    let duid: Duid = "abc123".into();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Mapped)
        .await;
    let ready = fixture
        .events
        .events()
        .into_iter()
        .find(|event| event.duid == duid)
        .unwrap();
    assert!(ready.capabilities.is_some());

    let devices = fixture.manager.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].state, DeviceLifecycleState::Mapped);

    fixture.manager.close().await;
}

#[tokio::test]
async fn mapped_devices_are_auto_connected() {
    let fixture = fixture(test_config());
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    fixture.manager.load().await;

    let duid: Duid = "abc123".into();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Connected)
        .await;

    // Ready first, connected after
    assert_eq!(
        fixture.events.states_of(&duid),
        vec![
            DeviceLifecycleState::Mapped,
            DeviceLifecycleState::Connected
        ]
    );

    fixture.manager.close().await;
}

#[tokio::test]
async fn disabling_auto_connect_defers_until_explicitly_requested() {
    let fixture = fixture(test_config().with_auto_connect(false));
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    fixture.manager.load().await;
    let duid: Duid = "abc123".into();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Mapped)
        .await;

    // No connection is attempted on its own
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        fixture.events.states_of(&duid),
        vec![DeviceLifecycleState::Mapped]
    );

    // Until a consumer asks for it
    fixture.manager.connect_device(&duid).await.unwrap();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Connected)
        .await;

    fixture.manager.close().await;
}

#[tokio::test]
async fn a_lost_connection_is_reported_once_and_recovered() {
    let fixture = fixture(test_config());
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    let channel = FakeChannel::new(true);
    fixture.transports.provide("abc123", channel.clone());

    fixture.manager.load().await;
    let duid: Duid = "abc123".into();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Connected)
        .await;

    // When the transport drops, the loss is reported and retried
    channel.drop_connection();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Disconnected)
        .await;
    fixture
        .events
        .wait_until(|events| {
            events
                .iter()
                .filter(|event| event.state == DeviceLifecycleState::Connected)
                .count()
                >= 2
        })
        .await;

    // Exactly one Disconnected notification despite ongoing retries
    let disconnects = fixture
        .events
        .states_of(&duid)
        .into_iter()
        .filter(|state| *state == DeviceLifecycleState::Disconnected)
        .count();
    assert_eq!(disconnects, 1);

    fixture.manager.close().await;
}

#[tokio::test]
async fn a_device_missing_from_one_refresh_is_kept() {
    let fixture = fixture(test_config());
    let duid: Duid = "abc123".into();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    // Scripted refreshes: present, missing once, present again
    fixture.account.push(snapshot(vec![descriptor("abc123")]));
    fixture.account.push(snapshot(vec![]));
    fixture.account.push(snapshot(vec![descriptor("abc123")]));

    fixture.manager.load().await;
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Mapped)
        .await;

    // Wait until the whole script has been consumed
    let account = fixture.account.clone();
    fixture
        .events
        .wait_until(move |_| account.calls() >= 4)
        .await;

    assert_eq!(fixture.manager.devices().await.len(), 1);
    assert!(!fixture
        .events
        .states_of(&duid)
        .contains(&DeviceLifecycleState::Removed));

    fixture.manager.close().await;
}

#[tokio::test]
async fn a_device_missing_from_two_refreshes_is_removed() {
    let fixture = fixture(test_config());
    let duid: Duid = "abc123".into();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    fixture.account.push(snapshot(vec![descriptor("abc123")]));
    fixture.account.push(snapshot(vec![]));
    fixture.account.push(snapshot(vec![]));

    fixture.manager.load().await;
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Removed)
        .await;

    assert!(fixture.manager.devices().await.is_empty());
    assert_matches!(
        fixture.manager.send(&duid, b"cmd", None).await,
        Err(RovacError::UnknownDevice { .. })
    );

    fixture.manager.close().await;
}

#[tokio::test]
async fn a_new_device_is_announced_without_disturbing_the_others() {
    let fixture = fixture(test_config());
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));
    fixture.transports.provide("def456", FakeChannel::new(true));

    fixture.account.push(snapshot(vec![
        descriptor("abc123"),
        descriptor("def456"),
    ]));

    fixture.manager.load().await;
    let known: Duid = "abc123".into();
    let added: Duid = "def456".into();

    fixture
        .events
        .wait_for_state(&added, DeviceLifecycleState::Mapped)
        .await;
    fixture
        .events
        .wait_for_state(&added, DeviceLifecycleState::Connected)
        .await;

    // The pre-existing device saw no extra lifecycle traffic
    let known_events = fixture.events.states_of(&known);
    assert_eq!(
        known_events
            .iter()
            .filter(|state| **state == DeviceLifecycleState::Mapped)
            .count(),
        1
    );
    assert!(!known_events.contains(&DeviceLifecycleState::Removed));
    assert_eq!(fixture.manager.devices().await.len(), 2);

    fixture.manager.close().await;
}

#[tokio::test]
async fn a_changed_descriptor_reannounces_updated_capabilities() {
    let fixture = fixture(test_config());
    let duid: Duid = "abc123".into();
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    // The refreshed descriptor reports new feature flags
    let mut upgraded = descriptor("abc123");
    upgraded.firmware_version = "02.17.00".into();
    upgraded.feature_flags = 0b101;
    fixture.account.push(snapshot(vec![upgraded]));

    fixture.manager.load().await;
    fixture
        .events
        .wait_until(|events| {
            events
                .iter()
                .filter(|event| event.capabilities.is_some())
                .count()
                >= 2
        })
        .await;

    let announcements: Vec<DeviceEvent> = fixture
        .events
        .events()
        .into_iter()
        .filter(|event| event.duid == duid && event.capabilities.is_some())
        .collect();
    assert!(!announcements[0]
        .capabilities
        .as_ref()
        .unwrap()
        .supports(Capability::AnyStateTransitGoto));
    assert!(announcements[1]
        .capabilities
        .as_ref()
        .unwrap()
        .supports(Capability::AnyStateTransitGoto));

    fixture.manager.close().await;
}

#[tokio::test]
async fn refresh_failures_keep_the_previous_snapshot() {
    let fixture = fixture(test_config());
    let duid: Duid = "abc123".into();
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));
    // No scripted refreshes: every fetch fails

    fixture.manager.load().await;
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Mapped)
        .await;

    // Several failed refreshes later the device is still there
    let account = fixture.account.clone();
    fixture
        .events
        .wait_until(move |_| account.calls() >= 3)
        .await;
    assert_eq!(fixture.manager.devices().await.len(), 1);
    assert!(!fixture
        .events
        .states_of(&duid)
        .contains(&DeviceLifecycleState::Removed));

    fixture.manager.close().await;
}

#[tokio::test]
async fn commands_to_different_devices_are_independent() {
    let fixture = fixture(test_config());
    fixture.cache
        .store_inventory(&snapshot(vec![descriptor("abc123"), descriptor("def456")]))
        .await
        .unwrap();
    let responsive = FakeChannel::new(true);
    responsive.push_response(b"pong");
    fixture.transports.provide("abc123", responsive.clone());
    // def456 never answers
    fixture.transports.provide("def456", FakeChannel::new(true));

    fixture.manager.load().await;
    let fast: Duid = "abc123".into();
    let slow: Duid = "def456".into();
    fixture
        .events
        .wait_for_state(&fast, DeviceLifecycleState::Connected)
        .await;
    fixture
        .events
        .wait_for_state(&slow, DeviceLifecycleState::Connected)
        .await;

    // A hanging command on one device must not block the other
    let manager = &fixture.manager;
    let started = tokio::time::Instant::now();
    let (fast_outcome, slow_outcome) = tokio::join!(
        manager.send(&fast, b"ping", Some(Duration::from_millis(500))),
        manager.send(&slow, b"ping", Some(Duration::from_millis(500))),
    );

    assert_eq!(fast_outcome.unwrap(), b"pong");
    assert_matches!(slow_outcome, Err(RovacError::RequestTimeout { .. }));
    // The slow device's timeout bounded the whole exchange
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        responsive.requests.lock().unwrap().as_slice(),
        &[b"ping".to_vec()]
    );

    fixture.manager.close().await;
}

#[tokio::test]
async fn overrides_in_the_cache_are_merged_at_registration() {
    let fixture = fixture(test_config());
    let duid: Duid = "abc123".into();
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture
        .cache
        .store_override(
            &duid,
            &CapabilityOverride::new("02.16.12").with_enabled(Capability::Matter),
        )
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    fixture.manager.load().await;
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Mapped)
        .await;

    let ready = fixture
        .events
        .events()
        .into_iter()
        .find(|event| event.capabilities.is_some())
        .unwrap();
    assert!(ready.capabilities.unwrap().supports(Capability::Matter));

    fixture.manager.close().await;
}

#[tokio::test]
async fn a_live_probe_override_reannounces_the_device() {
    let fixture = fixture(test_config());
    let duid: Duid = "abc123".into();
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    fixture.manager.load().await;
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Mapped)
        .await;

    let probed = CapabilityOverride::new("02.16.12").with_enabled(Capability::HotWashTowel);
    fixture.manager.record_override(&duid, probed).await.unwrap();

    fixture
        .events
        .wait_until(|events| {
            events.iter().any(|event| {
                event
                    .capabilities
                    .as_ref()
                    .is_some_and(|caps| caps.supports(Capability::HotWashTowel))
            })
        })
        .await;

    // And the override is persisted for the next run
    let stored = fixture.cache.load_override(&duid).await.unwrap().unwrap();
    assert!(stored.enabled.contains(&Capability::HotWashTowel));

    fixture.manager.close().await;
}

#[tokio::test]
async fn closing_stops_reconciliation_and_refuses_commands() {
    let fixture = fixture(test_config());
    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));

    fixture.manager.load().await;
    let duid: Duid = "abc123".into();
    fixture
        .events
        .wait_for_state(&duid, DeviceLifecycleState::Connected)
        .await;

    fixture.manager.close().await;
    // close() is idempotent
    fixture.manager.close().await;

    assert_matches!(
        fixture.manager.send(&duid, b"cmd", None).await,
        Err(RovacError::Closed)
    );

    // Reconciliation is cancelled: the fetch counter stops moving
    let calls = fixture.account.calls();
    tokio::time::sleep(RECONCILE_INTERVAL * 4).await;
    assert_eq!(fixture.account.calls(), calls);
}

#[tokio::test]
async fn removed_listeners_stop_receiving_events() {
    let fixture = fixture(test_config());
    let late = EventRecorder::default();
    let handle = fixture.manager.add_listener(late.listener());
    fixture.manager.remove_listener(handle);
    // Removing twice is fine
    fixture.manager.remove_listener(handle);

    fixture
        .cache
        .store_inventory(&snapshot(vec![descriptor("abc123")]))
        .await
        .unwrap();
    fixture.transports.provide("abc123", FakeChannel::new(true));
    fixture.manager.load().await;

    fixture
        .events
        .wait_for_state(&"abc123".into(), DeviceLifecycleState::Mapped)
        .await;
    assert!(late.events().is_empty());

    fixture.manager.close().await;
}
