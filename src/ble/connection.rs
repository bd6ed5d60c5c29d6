//! Link lifecycle management.
//!
//! [`ConnectionManager`] owns the single link to the sensor: it connects,
//! discovers the INFO characteristic with bounded in-place retries, reads and
//! subscribes, polls as a fallback to notifications, and recovers from link
//! loss with exponential backoff and the wake-scan cycle.
//!
//! The manager is a plain state machine. It never blocks and never spawns;
//! every input (commands, radio events, fired timers) is fed to it one at a
//! time by its owner, see [`SenseService`](crate::service::SenseService).

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::alerts::AlertSink;
use crate::ble::backoff::BackoffPolicy;
use crate::ble::radio::{
    CharacteristicHandle, DeviceId, DiscoveryOutcome, RadioEvent, RadioLink, SessionId,
};
use crate::ble::timer::{Scheduler, Timer, TimerKind, TimerQueue};
use crate::ble::uuids::{is_info_characteristic, INFO_CHARACTERISTIC_UUID, SENSE_SERVICE_UUID};
use crate::ble::wake_scan::WakeScanCycle;
use crate::config::LinkConfig;
use crate::error::Error;
use crate::store::StateStore;
use crate::telemetry::{DedupNotifier, TelemetryPipeline};

/// State of the link to the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// Not started, stopped, or no device identity known.
    #[default]
    Idle,
    /// A connect request is in flight.
    Connecting,
    /// Connected; looking for the INFO characteristic.
    Discovering,
    /// INFO characteristic resolved; reading and polling.
    Ready,
    /// Link lost; waiting for backoff or the wake scan.
    Disconnected,
}

impl LinkState {
    /// Whether a radio link is up.
    pub fn has_link(&self) -> bool {
        matches!(self, Self::Discovering | Self::Ready)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Retry bookkeeping of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryCounters {
    /// In-place discovery retries since the last fresh link.
    pub rediscover_tries: u32,
    /// Reconnects scheduled since the last successful connection.
    pub backoff_attempt: u32,
}

/// Everything the manager reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerInput {
    /// Host start command with an optional explicit device address.
    Start(Option<String>),
    /// Host stop command.
    Stop,
    /// Adapter switched on or off.
    AdapterPower(bool),
    /// Outcome reported by the radio.
    Radio(RadioEvent),
    /// A timer was delivered.
    Timer(Timer),
}

/// State machine owning the link to one sensor.
pub struct ConnectionManager<R: RadioLink> {
    radio: R,
    timers: TimerQueue,
    pipeline: TelemetryPipeline,
    store: Arc<dyn StateStore>,
    alerts: Arc<dyn AlertSink>,
    config: LinkConfig,
    backoff: BackoffPolicy,
    running: bool,
    device: Option<DeviceId>,
    state: LinkState,
    /// Session of the current connect attempt or link.
    session: Option<SessionId>,
    last_session: u64,
    handle: Option<CharacteristicHandle>,
    counters: RetryCounters,
    /// Connect requests since the last start command.
    connect_attempts: u32,
    wake: WakeScanCycle,
}

impl<R: RadioLink> ConnectionManager<R> {
    /// Create an idle manager.
    pub fn new(
        radio: R,
        scheduler: Box<dyn Scheduler>,
        store: Arc<dyn StateStore>,
        alerts: Arc<dyn AlertSink>,
        config: LinkConfig,
    ) -> Self {
        Self {
            radio,
            timers: TimerQueue::new(scheduler),
            pipeline: TelemetryPipeline::new(store.clone(), alerts.clone()),
            store,
            alerts,
            backoff: config.backoff(),
            config,
            running: false,
            device: None,
            state: LinkState::Idle,
            session: None,
            last_session: 0,
            handle: None,
            counters: RetryCounters::default(),
            connect_attempts: 0,
            wake: WakeScanCycle::new(),
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Device the manager is bound to, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Session of the current connect attempt or link.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Resolved INFO characteristic. `Some` exactly while [`LinkState::Ready`].
    pub fn handle(&self) -> Option<&CharacteristicHandle> {
        self.handle.as_ref()
    }

    /// Retry counters.
    pub fn counters(&self) -> RetryCounters {
        self.counters
    }

    /// Whether a start command is in effect.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a backoff reconnect is scheduled.
    pub fn is_reconnect_pending(&self) -> bool {
        self.timers.is_armed(TimerKind::Reconnect)
    }

    /// Wake-scan cycle state.
    pub fn wake_scan(&self) -> &WakeScanCycle {
        &self.wake
    }

    /// Presence and battery dedup state.
    pub fn dedup(&self) -> &DedupNotifier {
        self.pipeline.dedup()
    }

    /// Feed one input to the state machine.
    pub fn handle_input(&mut self, input: ManagerInput) {
        match input {
            ManagerInput::Start(identity) => self.start(identity.as_deref()),
            ManagerInput::Stop => self.stop(),
            ManagerInput::AdapterPower(on) => self.adapter_power_changed(on),
            ManagerInput::Radio(event) => self.on_radio_event(event),
            ManagerInput::Timer(timer) => self.on_timer(timer),
        }
    }

    /// Start maintaining the link.
    ///
    /// An explicit `identity` is persisted as the last-known device before
    /// anything else. Without one, the last-known device is resumed. With no
    /// identity at all the manager stays idle.
    pub fn start(&mut self, identity: Option<&str>) {
        let requested = identity.and_then(DeviceId::new);
        if let Some(id) = &requested {
            if let Err(e) = self.store.set_last_device_id(id.as_str()) {
                warn!("Failed to persist device id {}: {}", id, e);
            }
        }

        let device = requested.or_else(|| self.stored_device());
        self.running = true;

        let Some(device) = device else {
            warn!("{}; staying idle", Error::NoDeviceIdentity);
            return;
        };

        let same_device = self.device.as_ref() == Some(&device);
        if same_device
            && matches!(
                self.state,
                LinkState::Connecting | LinkState::Discovering | LinkState::Ready
            )
        {
            debug!("Start for {} ignored, link is {}", device, self.state);
            return;
        }

        info!("Starting link to {}", device);
        self.counters = RetryCounters::default();
        self.connect_attempts = 0;
        if !same_device {
            self.wake.stop_scan(&mut self.timers, &mut self.radio);
        }
        self.wake
            .nudge(&mut self.timers, &mut self.radio, &device, &self.config);
        self.device = Some(device);
        self.connect_now();
    }

    /// Stop everything and return to [`LinkState::Idle`].
    pub fn stop(&mut self) {
        self.running = false;
        self.timers.disarm_all();
        self.wake.stop(&mut self.timers, &mut self.radio);
        self.release_session();
        self.counters = RetryCounters::default();
        self.set_state(LinkState::Idle);
        info!("Sense link stopped");
    }

    /// React to the adapter being switched on or off.
    pub fn adapter_power_changed(&mut self, on: bool) {
        if !self.running {
            debug!("Adapter power {} while stopped; ignoring", on);
            return;
        }

        if !on {
            info!("Bluetooth adapter switched off");
            return;
        }

        if self.device.is_none() {
            self.device = self.stored_device();
        }

        match &self.device {
            None => warn!("Adapter on: {}", Error::NoDeviceIdentity),
            Some(_) if self.state == LinkState::Ready => debug!("Adapter on, link already ready"),
            Some(device) => {
                info!("Adapter on; connecting to {}", device);
                self.connect_now();
            }
        }
    }

    /// Apply an event reported by the radio.
    pub fn on_radio_event(&mut self, event: RadioEvent) {
        if let Some(session) = event.session() {
            if self.session != Some(session) {
                debug!("Discarding event from stale session {}: {:?}", session, event);
                return;
            }
        }

        match event {
            RadioEvent::Connected { session } => self.on_connected(session),
            RadioEvent::Disconnected { reason, .. } => self.on_link_lost(reason),
            RadioEvent::ServicesDiscovered { session, outcome } => {
                self.on_services_discovered(session, outcome)
            }
            RadioEvent::CharacteristicRead {
                characteristic,
                result,
                ..
            } => self.on_characteristic_read(characteristic, result),
            RadioEvent::Notification {
                characteristic,
                value,
                ..
            } => {
                if is_info_characteristic(&characteristic) {
                    trace!("INFO notification ({} bytes)", value.len());
                    self.pipeline.ingest(&value);
                }
            }
            RadioEvent::Advertisement { address } => self.on_advertisement(&address),
            RadioEvent::AdapterPowered(on) => self.adapter_power_changed(on),
        }
    }

    /// Apply a delivered timer. Stale or cancelled timers are dropped.
    pub fn on_timer(&mut self, timer: Timer) {
        if !self.timers.fire(timer) {
            trace!("Discarding stale {} timer", timer.kind);
            return;
        }

        match timer.kind {
            TimerKind::Reconnect => {
                if self.session.is_some() {
                    debug!("Reconnect timer fired with a session in flight; ignoring");
                    return;
                }
                info!("Reconnecting (attempt {})", self.counters.backoff_attempt);
                self.connect_now();
            }
            TimerKind::Rediscover => {
                if self.state == LinkState::Discovering {
                    self.request_discovery();
                }
            }
            TimerKind::Poll => self.poll_tick(),
            TimerKind::WakeScanCycle => {
                let link_up = self.session.is_some();
                self.wake.tick(
                    &mut self.timers,
                    &mut self.radio,
                    self.device.as_ref(),
                    link_up,
                    &self.config,
                );
            }
            TimerKind::WakeScanStop => self.wake.stop_scan(&mut self.timers, &mut self.radio),
        }
    }

    fn on_connected(&mut self, session: SessionId) {
        if self.state != LinkState::Connecting {
            debug!("Connected event in state {}; ignoring", self.state);
            return;
        }

        info!("Connected to sensor (session {})", session);
        self.set_state(LinkState::Discovering);
        self.wake.stop(&mut self.timers, &mut self.radio);
        self.timers.disarm(TimerKind::Reconnect);
        self.counters = RetryCounters::default();
        self.pipeline.clear_presence();

        if let Some(device) = &self.device {
            if let Err(e) = self.store.set_last_device_id(device.as_str()) {
                warn!("Failed to persist device id {}: {}", device, e);
            }
        }

        self.alerts
            .status_changed(true, "Connected — discovering services…");

        if let Err(e) = self.radio.request_high_priority() {
            debug!("Connection priority request ignored: {}", e);
        }
        if let Err(e) = self.radio.request_mtu(self.config.mtu) {
            debug!("MTU request ignored: {}", e);
        }

        self.request_discovery();
    }

    fn on_services_discovered(&mut self, session: SessionId, outcome: DiscoveryOutcome) {
        if self.state != LinkState::Discovering {
            debug!("Discovery result in state {}; ignoring", self.state);
            return;
        }

        match outcome {
            DiscoveryOutcome::Failed(reason) => {
                warn!("Service discovery failed: {}", reason);
                self.timers.arm(
                    TimerKind::Rediscover,
                    self.config.discovery_failure_retry,
                );
            }
            DiscoveryOutcome::Success(table) => {
                debug!("{}", table);
                if table
                    .find(&SENSE_SERVICE_UUID, &INFO_CHARACTERISTIC_UUID)
                    .is_some()
                {
                    self.enter_ready(session);
                } else {
                    self.retry_discovery_in_place();
                }
            }
        }
    }

    fn enter_ready(&mut self, session: SessionId) {
        self.counters = RetryCounters::default();
        self.timers.disarm(TimerKind::Rediscover);

        let handle = CharacteristicHandle {
            session,
            service: SENSE_SERVICE_UUID,
            characteristic: INFO_CHARACTERISTIC_UUID,
        };
        self.set_state(LinkState::Ready);
        self.handle = Some(handle.clone());

        if let Err(e) = self.radio.read_characteristic(&handle) {
            warn!("Initial INFO read failed: {}", e);
        }
        if let Err(e) = self.radio.subscribe(&handle) {
            debug!("INFO notifications unavailable, relying on polling: {}", e);
        }

        self.timers.arm(TimerKind::Poll, self.config.poll_interval);
        self.alerts.status_changed(true, "Connected");
        info!("Sense link ready");
    }

    fn retry_discovery_in_place(&mut self) {
        self.counters.rediscover_tries += 1;
        let tries = self.counters.rediscover_tries;
        warn!("Sense service/INFO not found (try {})", tries);

        if self.config.refreshes_cache_on(tries) {
            let refreshed = self.radio.refresh_service_cache();
            debug!("Service cache refresh -> {}", refreshed);
        }

        if tries < self.config.max_rediscover_tries {
            self.timers.arm(
                TimerKind::Rediscover,
                self.config.rediscover_delay(tries),
            );
            return;
        }

        info!("In-place rediscovery exhausted after {} tries; reconnecting", tries);
        self.counters.rediscover_tries = 0;
        self.connect_now();
    }

    fn on_characteristic_read(
        &mut self,
        characteristic: Uuid,
        result: std::result::Result<bytes::Bytes, String>,
    ) {
        if !is_info_characteristic(&characteristic) {
            return;
        }

        match result {
            Ok(value) => {
                self.pipeline.ingest(&value);
            }
            Err(reason) => {
                warn!("INFO read failed: {}", reason);
                if self.state == LinkState::Ready {
                    // Handle may be stale; resolve it again.
                    self.set_state(LinkState::Discovering);
                    self.request_discovery();
                }
            }
        }
    }

    fn on_advertisement(&mut self, address: &str) {
        if !self.running || !self.wake.is_scanning() {
            return;
        }
        let Some(device) = &self.device else {
            return;
        };
        if !device.matches(address) {
            return;
        }

        debug!("Wake scan saw {}", address);
        self.wake.stop_scan(&mut self.timers, &mut self.radio);
        if self.session.is_none() {
            self.connect_now();
        }
    }

    fn on_link_lost(&mut self, reason: Option<String>) {
        info!(
            "Link lost in state {}: {}",
            self.state,
            reason.as_deref().unwrap_or("no reason given")
        );

        self.timers.disarm(TimerKind::Rediscover);
        self.release_session();
        self.counters.rediscover_tries = 0;
        self.set_state(LinkState::Disconnected);
        self.alerts.status_changed(false, "Reconnecting…");

        self.pipeline.link_lost();

        self.wake.start(
            &mut self.timers,
            &mut self.radio,
            self.device.as_ref(),
            false,
            &self.config,
        );
        self.schedule_reconnect();
    }

    /// Arm the backoff reconnect. No-op while one is already pending.
    fn schedule_reconnect(&mut self) {
        if !self.running || self.device.is_none() {
            return;
        }
        if self.timers.is_armed(TimerKind::Reconnect) {
            trace!("Reconnect already pending");
            return;
        }

        let delay = self.backoff.delay(self.counters.backoff_attempt);
        self.counters.backoff_attempt = self.counters.backoff_attempt.saturating_add(1);
        debug!("Reconnect in {:?}", delay);
        self.timers.arm(TimerKind::Reconnect, delay);
    }

    fn poll_tick(&mut self) {
        if self.state != LinkState::Ready {
            return;
        }

        let Some(handle) = self.handle.clone() else {
            self.set_state(LinkState::Discovering);
            self.request_discovery();
            return;
        };

        if let Err(e) = self.radio.read_characteristic(&handle) {
            warn!("read INFO failed: {}", e);
        }
        self.timers.arm(TimerKind::Poll, self.config.poll_interval);
    }

    fn request_discovery(&mut self) {
        let Some(session) = self.session else {
            return;
        };
        if let Err(e) = self.radio.discover_services(session) {
            warn!("Service discovery request failed: {}", e);
            self.timers.arm(
                TimerKind::Rediscover,
                self.config.discovery_failure_retry,
            );
        }
    }

    /// Issue a fresh connect under a new session.
    fn connect_now(&mut self) {
        let Some(device) = self.device.clone() else {
            return;
        };

        self.timers.disarm(TimerKind::Reconnect);
        self.timers.disarm(TimerKind::Rediscover);
        self.release_session();

        self.last_session += 1;
        let session = SessionId(self.last_session);
        let auto_reconnect = self.connect_attempts > 0;
        self.connect_attempts = self.connect_attempts.saturating_add(1);

        self.session = Some(session);
        self.set_state(LinkState::Connecting);
        self.alerts
            .status_changed(false, &format!("Connecting to {}…", device));

        self.wake.start(
            &mut self.timers,
            &mut self.radio,
            Some(&device),
            true,
            &self.config,
        );

        debug!(
            "Connecting to {} (session {}, auto_reconnect={})",
            device, session, auto_reconnect
        );
        if let Err(e) = self.radio.connect(session, &device, auto_reconnect) {
            warn!("Connect request for {} rejected: {}", device, e);
            self.on_link_lost(Some(e.to_string()));
        }
    }

    /// Disconnect and forget the current session. Best-effort.
    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.radio.disconnect() {
                debug!("Ignoring disconnect failure for session {}: {}", session, e);
            }
        }
        self.handle = None;
    }

    fn stored_device(&self) -> Option<DeviceId> {
        self.store.last_device_id().and_then(DeviceId::new)
    }

    fn set_state(&mut self, new_state: LinkState) {
        let old_state = self.state;
        self.state = new_state;

        if new_state != LinkState::Ready {
            self.handle = None;
            self.timers.disarm(TimerKind::Poll);
        }

        if old_state != new_state {
            debug!("Link state changed: {} -> {}", old_state, new_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::{FakeRadio, ManualScheduler, RadioRequest, RecordingAlerts};
    use crate::ble::radio::{GattCharacteristic, GattService, GattTable};
    use crate::store::MemoryStore;
    use crate::telemetry::ABSENT_PAYLOAD;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    struct Harness {
        manager: ConnectionManager<FakeRadio>,
        radio: FakeRadio,
        scheduler: ManualScheduler,
        store: Arc<MemoryStore>,
        alerts: Arc<RecordingAlerts>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_store(MemoryStore::new())
        }

        fn with_store(store: MemoryStore) -> Self {
            let radio = FakeRadio::new();
            let scheduler = ManualScheduler::new();
            let store = Arc::new(store);
            let alerts = Arc::new(RecordingAlerts::new());
            let manager = ConnectionManager::new(
                radio.clone(),
                Box::new(scheduler.clone()),
                store.clone(),
                alerts.clone(),
                LinkConfig::default(),
            );
            Self {
                manager,
                radio,
                scheduler,
                store,
                alerts,
            }
        }

        fn session(&self) -> SessionId {
            self.manager.session().expect("no active session")
        }

        fn connected(&mut self) {
            let session = self.session();
            self.manager
                .on_radio_event(RadioEvent::Connected { session });
        }

        fn discovered(&mut self, table: GattTable) {
            let session = self.session();
            self.manager.on_radio_event(RadioEvent::ServicesDiscovered {
                session,
                outcome: DiscoveryOutcome::Success(table),
            });
        }

        fn read(&mut self, payload: &str) {
            let session = self.session();
            self.manager.on_radio_event(RadioEvent::CharacteristicRead {
                session,
                characteristic: INFO_CHARACTERISTIC_UUID,
                result: Ok(Bytes::copy_from_slice(payload.as_bytes())),
            });
        }

        fn drop_link(&mut self) {
            let session = self.session();
            self.manager.on_radio_event(RadioEvent::Disconnected {
                session,
                reason: Some("supervision timeout".to_string()),
            });
        }

        fn fire(&mut self, kind: TimerKind) -> bool {
            match self.scheduler.take(kind) {
                Some(timer) => {
                    self.manager.on_timer(timer);
                    true
                }
                None => false,
            }
        }

        fn pending_delay(&self, kind: TimerKind) -> Option<Duration> {
            self.scheduler.pending(kind).map(|(_, delay)| delay)
        }

        fn bring_up(&mut self) {
            self.manager.start(Some(ADDRESS));
            self.connected();
            self.discovered(info_table());
        }

        fn reads(&self) -> usize {
            self.radio
                .count(|r| matches!(r, RadioRequest::Read { .. }))
        }

        fn connects(&self) -> usize {
            self.radio
                .count(|r| matches!(r, RadioRequest::Connect { .. }))
        }
    }

    fn info_table() -> GattTable {
        GattTable::new(vec![GattService {
            uuid: SENSE_SERVICE_UUID,
            characteristics: vec![GattCharacteristic {
                uuid: INFO_CHARACTERISTIC_UUID,
                properties: 0x12,
            }],
        }])
    }

    fn generic_table() -> GattTable {
        GattTable::new(vec![GattService {
            uuid: Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb),
            characteristics: vec![],
        }])
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Discovering.to_string(), "Discovering");
        assert!(LinkState::Ready.has_link());
        assert!(!LinkState::Connecting.has_link());
        assert_eq!(LinkState::default(), LinkState::Idle);
    }

    #[test]
    fn test_end_to_end_first_try() {
        let mut h = Harness::new();

        h.manager.start(Some(ADDRESS));
        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(
            h.radio.last_connect(),
            Some(RadioRequest::Connect {
                session: SessionId(1),
                device: ADDRESS.to_string(),
                auto_reconnect: false,
            })
        );

        h.connected();
        assert_eq!(h.manager.state(), LinkState::Discovering);

        h.discovered(info_table());
        assert_eq!(h.manager.state(), LinkState::Ready);
        assert_eq!(h.reads(), 1);
        assert_eq!(
            h.radio
                .count(|r| matches!(r, RadioRequest::Subscribe { .. })),
            1
        );

        h.read(r#"{"present":true,"user":"Bob","battery_pct":45}"#);

        assert_eq!(h.alerts.presence(), vec!["Bob detected near your SensePi"]);
        assert!(h.alerts.battery().is_empty());
        assert_eq!(h.store.snapshot().battery_pct_cached, 45);
        assert_eq!(
            h.alerts.last_status(),
            Some((true, "Connected".to_string()))
        );
    }

    #[test]
    fn test_start_scans_alongside_first_connect() {
        let mut h = Harness::new();

        h.manager.start(Some(ADDRESS));

        assert_eq!(
            h.radio.take(),
            vec![
                RadioRequest::StartScan {
                    device: ADDRESS.to_string(),
                    duration: Duration::from_secs(5),
                },
                RadioRequest::Connect {
                    session: SessionId(1),
                    device: ADDRESS.to_string(),
                    auto_reconnect: false,
                },
            ]
        );
        assert!(h.manager.wake_scan().is_scanning());
        assert_eq!(
            h.pending_delay(TimerKind::WakeScanStop),
            Some(Duration::from_secs(5))
        );

        // Seeing the sensor while the connect is in flight only ends the scan.
        h.manager.on_radio_event(RadioEvent::Advertisement {
            address: ADDRESS.to_string(),
        });
        assert_eq!(h.radio.take(), vec![RadioRequest::StopScan]);
        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(h.connects(), 1);
    }

    #[test]
    fn test_start_persists_identity_before_connecting() {
        let mut h = Harness::new();
        h.radio.set_reject_connect(true);

        h.manager.start(Some(ADDRESS));

        assert_eq!(h.store.last_device_id().as_deref(), Some(ADDRESS));
    }

    #[test]
    fn test_start_without_identity_resumes_last_device() {
        let mut h = Harness::with_store(MemoryStore::with_last_device_id("11:22:33:44:55:66"));

        h.manager.start(None);

        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(
            h.radio.last_connect(),
            Some(RadioRequest::Connect {
                session: SessionId(1),
                device: "11:22:33:44:55:66".to_string(),
                auto_reconnect: false,
            })
        );
    }

    #[test]
    fn test_start_without_any_identity_stays_idle() {
        let mut h = Harness::new();

        h.manager.start(None);

        assert!(h.manager.is_running());
        assert_eq!(h.manager.state(), LinkState::Idle);
        assert!(h.radio.requests().is_empty());
        assert!(h.scheduler.pending_kinds().is_empty());
    }

    #[test]
    fn test_start_same_device_is_noop() {
        let mut h = Harness::new();
        h.manager.start(Some(ADDRESS));
        h.manager.start(Some(ADDRESS));
        h.connected();
        h.manager.start(Some(ADDRESS));

        assert_eq!(h.connects(), 1);
        assert_eq!(h.manager.state(), LinkState::Discovering);
    }

    #[test]
    fn test_start_other_device_releases_session() {
        let mut h = Harness::new();
        h.bring_up();

        h.manager.start(Some("11:22:33:44:55:66"));

        assert_eq!(h.radio.count(|r| *r == RadioRequest::Disconnect), 1);
        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(h.session(), SessionId(2));
        assert_eq!(h.manager.device().map(DeviceId::as_str), Some("11:22:33:44:55:66"));
    }

    #[test]
    fn test_connected_side_effects() {
        let mut h = Harness::with_store(MemoryStore::with_last_device_id("stale"));
        h.manager.start(None);
        h.store.set_last_device_id("something else").unwrap();
        h.radio.take();

        h.connected();

        assert_eq!(h.store.last_device_id().as_deref(), Some("stale"));
        assert_eq!(
            h.radio.take(),
            vec![
                RadioRequest::StopScan,
                RadioRequest::RequestHighPriority,
                RadioRequest::RequestMtu(185),
                RadioRequest::DiscoverServices {
                    session: SessionId(1)
                },
            ]
        );
        assert!(!h.manager.wake_scan().is_running());
        assert_eq!(
            h.alerts.last_status(),
            Some((true, "Connected — discovering services…".to_string()))
        );
    }

    #[test]
    fn test_rediscovery_escalates_after_six_misses() {
        let mut h = Harness::new();
        h.manager.start(Some(ADDRESS));
        h.connected();

        for tries in 1..=5u32 {
            h.discovered(generic_table());
            assert_eq!(h.manager.state(), LinkState::Discovering);
            assert_eq!(h.manager.counters().rediscover_tries, tries);
            assert_eq!(
                h.pending_delay(TimerKind::Rediscover),
                Some(Duration::from_millis(1200 * tries as u64))
            );
            assert!(h.fire(TimerKind::Rediscover));
        }
        assert_eq!(h.radio.count(|r| *r == RadioRequest::RefreshCache), 2);
        assert_eq!(
            h.radio
                .count(|r| matches!(r, RadioRequest::DiscoverServices { .. })),
            6
        );

        h.discovered(generic_table());

        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(h.manager.counters().rediscover_tries, 0);
        assert_eq!(h.session(), SessionId(2));
        assert_eq!(h.radio.count(|r| *r == RadioRequest::Disconnect), 1);
        assert_eq!(
            h.radio.last_connect(),
            Some(RadioRequest::Connect {
                session: SessionId(2),
                device: ADDRESS.to_string(),
                auto_reconnect: true,
            })
        );
        assert!(h.pending_delay(TimerKind::Rediscover).is_none());
    }

    #[test]
    fn test_discovery_failure_retries_without_counting() {
        let mut h = Harness::new();
        h.manager.start(Some(ADDRESS));
        h.connected();

        let session = h.session();
        h.manager.on_radio_event(RadioEvent::ServicesDiscovered {
            session,
            outcome: DiscoveryOutcome::Failed("status 133".to_string()),
        });

        assert_eq!(h.manager.state(), LinkState::Discovering);
        assert_eq!(h.manager.counters().rediscover_tries, 0);
        assert_eq!(
            h.pending_delay(TimerKind::Rediscover),
            Some(Duration::from_millis(1000))
        );

        assert!(h.fire(TimerKind::Rediscover));
        assert_eq!(
            h.radio
                .count(|r| matches!(r, RadioRequest::DiscoverServices { .. })),
            2
        );

        h.discovered(info_table());
        assert_eq!(h.manager.state(), LinkState::Ready);
    }

    #[test]
    fn test_link_loss_synthesizes_absence_and_recovers() {
        let mut h = Harness::new();
        h.bring_up();
        h.read(r#"{"present":true,"user":"Bob"}"#);
        assert!(h.store.snapshot().presence_present);

        h.drop_link();

        assert_eq!(h.manager.state(), LinkState::Disconnected);
        assert!(h.manager.handle().is_none());
        assert!(h.manager.session().is_none());
        assert_eq!(h.manager.dedup().presence_signature(), None);

        let snapshot = h.store.snapshot();
        assert!(!snapshot.presence_present);
        assert_eq!(snapshot.info_json, ABSENT_PAYLOAD);

        assert!(h.pending_delay(TimerKind::Poll).is_none());
        assert_eq!(h.pending_delay(TimerKind::Reconnect), Some(Duration::from_secs(1)));
        assert!(h.manager.is_reconnect_pending());
        assert!(h.manager.wake_scan().is_scanning());
        assert_eq!(
            h.alerts.last_status(),
            Some((false, "Reconnecting…".to_string()))
        );

        // Same person after the link comes back is announced again.
        assert!(h.fire(TimerKind::Reconnect));
        h.connected();
        h.discovered(info_table());
        h.read(r#"{"present":true,"user":"Bob"}"#);
        assert_eq!(h.alerts.presence().len(), 2);
    }

    #[test]
    fn test_backoff_grows_and_resets_on_connect() {
        let mut h = Harness::new();
        h.bring_up();

        h.drop_link();
        assert_eq!(h.pending_delay(TimerKind::Reconnect), Some(Duration::from_secs(1)));

        assert!(h.fire(TimerKind::Reconnect));
        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert!(matches!(
            h.radio.last_connect(),
            Some(RadioRequest::Connect {
                auto_reconnect: true,
                ..
            })
        ));

        h.drop_link();
        assert_eq!(h.pending_delay(TimerKind::Reconnect), Some(Duration::from_secs(2)));
        assert!(h.fire(TimerKind::Reconnect));

        h.drop_link();
        assert_eq!(h.pending_delay(TimerKind::Reconnect), Some(Duration::from_secs(4)));
        assert!(h.fire(TimerKind::Reconnect));

        h.connected();
        assert_eq!(h.manager.counters().backoff_attempt, 0);
    }

    #[test]
    fn test_reconnect_is_single_flight() {
        let mut h = Harness::new();
        h.bring_up();
        h.drop_link();

        h.manager.schedule_reconnect();
        h.manager.schedule_reconnect();

        assert_eq!(
            h.scheduler
                .pending_kinds()
                .into_iter()
                .filter(|k| *k == TimerKind::Reconnect)
                .count(),
            1
        );
        assert_eq!(h.manager.counters().backoff_attempt, 1);
    }

    #[test]
    fn test_rejected_connect_falls_back_to_backoff() {
        let mut h = Harness::new();
        h.radio.set_reject_connect(true);

        h.manager.start(Some(ADDRESS));

        assert_eq!(h.manager.state(), LinkState::Disconnected);
        assert!(h.manager.session().is_none());
        assert_eq!(h.pending_delay(TimerKind::Reconnect), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_stale_session_events_are_ignored() {
        let mut h = Harness::new();
        h.bring_up();
        let old = h.session();
        h.drop_link();
        assert!(h.fire(TimerKind::Reconnect));
        assert_ne!(h.session(), old);

        h.manager
            .on_radio_event(RadioEvent::Connected { session: old });
        h.manager.on_radio_event(RadioEvent::CharacteristicRead {
            session: old,
            characteristic: INFO_CHARACTERISTIC_UUID,
            result: Ok(Bytes::from_static(br#"{"present":true,"user":"Eve"}"#)),
        });
        h.manager.on_radio_event(RadioEvent::Disconnected {
            session: old,
            reason: None,
        });

        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert!(h.alerts.presence().is_empty());
        assert_eq!(h.store.snapshot().info_json, ABSENT_PAYLOAD);
    }

    #[test]
    fn test_stale_poll_timer_does_not_resurrect() {
        let mut h = Harness::new();
        h.bring_up();
        let (poll, _) = h.scheduler.pending(TimerKind::Poll).unwrap();

        h.drop_link();
        let reads = h.reads();
        h.manager.on_timer(poll);

        assert_eq!(h.reads(), reads);
        assert!(h.pending_delay(TimerKind::Poll).is_none());
    }

    #[test]
    fn test_poll_reads_and_rearms() {
        let mut h = Harness::new();
        h.bring_up();
        assert_eq!(h.pending_delay(TimerKind::Poll), Some(Duration::from_secs(15)));

        assert!(h.fire(TimerKind::Poll));
        assert_eq!(h.reads(), 2);
        assert_eq!(h.pending_delay(TimerKind::Poll), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_notification_is_ingested() {
        let mut h = Harness::new();
        h.bring_up();
        let session = h.session();

        h.manager.on_radio_event(RadioEvent::Notification {
            session,
            characteristic: INFO_CHARACTERISTIC_UUID,
            value: Bytes::from_static(br#"{"presence":{"state":"sitting","user":"Ann"}}"#),
        });

        assert_eq!(h.alerts.presence(), vec!["Ann detected near your SensePi"]);
    }

    #[test]
    fn test_read_failure_rediscovers_without_clearing_dedup() {
        let mut h = Harness::new();
        h.bring_up();
        h.read(r#"{"present":true,"user":"Bob","place":"desk"}"#);
        let session = h.session();

        h.manager.on_radio_event(RadioEvent::CharacteristicRead {
            session,
            characteristic: INFO_CHARACTERISTIC_UUID,
            result: Err("invalid handle".to_string()),
        });

        assert_eq!(h.manager.state(), LinkState::Discovering);
        assert!(h.manager.handle().is_none());
        assert!(h.pending_delay(TimerKind::Poll).is_none());
        assert_eq!(
            h.radio
                .count(|r| matches!(r, RadioRequest::DiscoverServices { .. })),
            2
        );
        assert_eq!(h.manager.dedup().presence_signature(), Some("Bob@desk"));

        h.discovered(info_table());
        h.read(r#"{"present":true,"user":"Bob","place":"desk"}"#);
        assert_eq!(h.alerts.presence().len(), 1);
    }

    #[test]
    fn test_wake_scan_advertisement_triggers_connect() {
        let mut h = Harness::new();
        h.bring_up();
        h.drop_link();
        let connects = h.connects();
        let stops = h.radio.count(|r| *r == RadioRequest::StopScan);

        h.manager.on_radio_event(RadioEvent::Advertisement {
            address: "00:00:00:00:00:01".to_string(),
        });
        assert_eq!(h.connects(), connects);

        h.manager.on_radio_event(RadioEvent::Advertisement {
            address: ADDRESS.to_lowercase(),
        });

        assert_eq!(h.connects(), connects + 1);
        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert!(!h.manager.wake_scan().is_scanning());
        assert!(!h.manager.is_reconnect_pending());
        assert_eq!(h.radio.count(|r| *r == RadioRequest::StopScan), stops + 1);
    }

    #[test]
    fn test_wake_scan_cycle_while_disconnected() {
        let mut h = Harness::new();
        h.bring_up();
        let scans = h.radio.count(|r| matches!(r, RadioRequest::StartScan { .. }));
        h.drop_link();
        assert_eq!(
            h.radio.count(|r| matches!(r, RadioRequest::StartScan { .. })),
            scans + 1
        );

        assert!(h.fire(TimerKind::WakeScanStop));
        assert!(!h.manager.wake_scan().is_scanning());

        assert!(h.fire(TimerKind::WakeScanCycle));
        assert_eq!(
            h.radio.count(|r| matches!(r, RadioRequest::StartScan { .. })),
            scans + 2
        );
        assert_eq!(
            h.pending_delay(TimerKind::WakeScanCycle),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_stop_cancels_everything() {
        let mut h = Harness::new();
        h.bring_up();
        h.drop_link();
        let (reconnect, _) = h.scheduler.pending(TimerKind::Reconnect).unwrap();
        let disconnects = h.radio.count(|r| *r == RadioRequest::Disconnect);
        let stops = h.radio.count(|r| *r == RadioRequest::StopScan);

        h.manager.stop();

        assert_eq!(h.manager.state(), LinkState::Idle);
        assert!(!h.manager.is_running());
        assert!(h.scheduler.pending_kinds().is_empty());
        assert!(!h.manager.wake_scan().is_running());
        assert_eq!(h.radio.count(|r| *r == RadioRequest::StopScan), stops + 1);
        // Session was already released on link loss.
        assert_eq!(h.radio.count(|r| *r == RadioRequest::Disconnect), disconnects);

        let connects = h.connects();
        h.manager.on_timer(reconnect);
        assert_eq!(h.connects(), connects);
    }

    #[test]
    fn test_stop_while_ready_releases_session() {
        let mut h = Harness::new();
        h.bring_up();
        let session = h.session();

        h.manager.stop();

        assert_eq!(h.radio.count(|r| *r == RadioRequest::Disconnect), 1);
        assert!(h.manager.handle().is_none());

        h.manager.on_radio_event(RadioEvent::Disconnected {
            session,
            reason: None,
        });
        assert_eq!(h.manager.state(), LinkState::Idle);
        assert!(h.scheduler.pending_kinds().is_empty());
    }

    #[test]
    fn test_adapter_on_reads_identity_from_store() {
        let mut h = Harness::new();
        h.manager.start(None);
        h.store.set_last_device_id(ADDRESS).unwrap();

        h.manager.adapter_power_changed(true);

        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(h.connects(), 1);
    }

    #[test]
    fn test_adapter_on_while_disconnected_connects_at_once() {
        let mut h = Harness::new();
        h.bring_up();
        h.drop_link();
        assert!(h.manager.is_reconnect_pending());
        let (backoff, _) = h.scheduler.pending(TimerKind::Reconnect).unwrap();

        h.manager.adapter_power_changed(true);

        assert_eq!(h.manager.state(), LinkState::Connecting);
        assert_eq!(h.connects(), 2);
        assert_eq!(
            h.radio.last_connect(),
            Some(RadioRequest::Connect {
                session: SessionId(2),
                device: ADDRESS.to_string(),
                auto_reconnect: true,
            })
        );
        assert!(!h.manager.is_reconnect_pending());

        // The replaced backoff timer no longer reconnects.
        h.manager.on_timer(backoff);
        assert_eq!(h.connects(), 2);
        assert_eq!(h.session(), SessionId(2));
    }

    #[test]
    fn test_adapter_events_ignored_when_stopped_or_ready() {
        let mut h = Harness::with_store(MemoryStore::with_last_device_id(ADDRESS));
        h.manager.adapter_power_changed(true);
        assert!(h.radio.requests().is_empty());

        h.bring_up();
        h.manager.on_radio_event(RadioEvent::AdapterPowered(true));
        assert_eq!(h.manager.state(), LinkState::Ready);
        assert_eq!(h.connects(), 1);
    }

    #[test]
    fn test_handle_input_routes() {
        let mut h = Harness::new();
        h.manager
            .handle_input(ManagerInput::Start(Some(ADDRESS.to_string())));
        assert_eq!(h.manager.state(), LinkState::Connecting);

        h.manager.handle_input(ManagerInput::Stop);
        assert_eq!(h.manager.state(), LinkState::Idle);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Stop,
        Connected,
        DiscoverFound,
        DiscoverMissing,
        DiscoverFailed,
        Disconnected,
        ReadOk,
        ReadFailed,
        Advertise,
        AdapterOn,
        Fire(TimerKind),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Stop),
            Just(Op::Connected),
            Just(Op::DiscoverFound),
            Just(Op::DiscoverMissing),
            Just(Op::DiscoverFailed),
            Just(Op::Disconnected),
            Just(Op::ReadOk),
            Just(Op::ReadFailed),
            Just(Op::Advertise),
            Just(Op::AdapterOn),
            Just(Op::Fire(TimerKind::Reconnect)),
            Just(Op::Fire(TimerKind::Rediscover)),
            Just(Op::Fire(TimerKind::Poll)),
            Just(Op::Fire(TimerKind::WakeScanCycle)),
            Just(Op::Fire(TimerKind::WakeScanStop)),
        ]
    }

    fn apply(h: &mut Harness, op: Op) {
        let session = h.manager.session().unwrap_or(SessionId(0));
        let event = match op {
            Op::Start => return h.manager.start(Some(ADDRESS)),
            Op::Stop => return h.manager.stop(),
            Op::AdapterOn => return h.manager.adapter_power_changed(true),
            Op::Fire(kind) => {
                h.fire(kind);
                return;
            }
            Op::Connected => RadioEvent::Connected { session },
            Op::DiscoverFound => RadioEvent::ServicesDiscovered {
                session,
                outcome: DiscoveryOutcome::Success(info_table()),
            },
            Op::DiscoverMissing => RadioEvent::ServicesDiscovered {
                session,
                outcome: DiscoveryOutcome::Success(generic_table()),
            },
            Op::DiscoverFailed => RadioEvent::ServicesDiscovered {
                session,
                outcome: DiscoveryOutcome::Failed("busy".to_string()),
            },
            Op::Disconnected => RadioEvent::Disconnected {
                session,
                reason: None,
            },
            Op::ReadOk => RadioEvent::CharacteristicRead {
                session,
                characteristic: INFO_CHARACTERISTIC_UUID,
                result: Ok(Bytes::from_static(br#"{"present":true,"battery_pct":20}"#)),
            },
            Op::ReadFailed => RadioEvent::CharacteristicRead {
                session,
                characteristic: INFO_CHARACTERISTIC_UUID,
                result: Err("gatt error".to_string()),
            },
            Op::Advertise => RadioEvent::Advertisement {
                address: ADDRESS.to_string(),
            },
        };
        h.manager.on_radio_event(event);
    }

    proptest! {
        #[test]
        fn prop_handle_iff_ready(ops in prop::collection::vec(op_strategy(), 0..60)) {
            let mut h = Harness::new();
            for op in ops {
                apply(&mut h, op);

                let ready = h.manager.state() == LinkState::Ready;
                prop_assert_eq!(h.manager.handle().is_some(), ready);
                if let Some(handle) = h.manager.handle() {
                    prop_assert_eq!(Some(handle.session), h.manager.session());
                }
                if ready {
                    prop_assert!(!h.manager.is_reconnect_pending());
                }
                if h.manager.state() == LinkState::Disconnected && h.manager.is_running() {
                    prop_assert!(h.manager.is_reconnect_pending());
                }
            }
        }
    }
}
