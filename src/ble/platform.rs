//! btleplug-backed [`RadioLink`].
//!
//! btleplug's API is `async`; the link state machine expects requests that
//! return immediately. Each request is spawned onto the runtime captured at
//! construction and its outcome is sent back as a [`RadioEvent`] on the
//! channel returned by [`BtleplugRadio::new`].

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ble::radio::{
    CharacteristicHandle, DeviceId, DiscoveryOutcome, GattCharacteristic,
    GattService, GattTable, RadioEvent, RadioLink, SessionId,
};
use crate::error::{Error, Result};

/// Connect attempts made at the radio layer when auto-reconnect is requested.
const AUTO_RECONNECT_ATTEMPTS: u32 = 3;

/// Delay between radio-layer connect attempts.
const AUTO_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a connect waits for the adapter to see the peripheral.
const PERIPHERAL_WAIT: Duration = Duration::from_secs(5);

/// Interval between peripheral lookups while waiting.
const PERIPHERAL_POLL: Duration = Duration::from_millis(250);

/// Get the first Bluetooth adapter of the system.
///
/// # Errors
///
/// Returns [`Error::BluetoothUnavailable`] if there is no usable adapter.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|_e| Error::BluetoothUnavailable)?;

    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(Error::BluetoothUnavailable)?;

    info!(
        "Using Bluetooth adapter: {:?}",
        adapter.adapter_info().await.ok()
    );

    Ok(adapter)
}

/// Disconnect still in flight at the radio.
///
/// Connects wait on it so a dying link is never adopted by a new session.
#[derive(Clone, Default)]
struct PendingDisconnect(Option<SharedFuture<BoxFuture<'static, ()>>>);

impl PendingDisconnect {
    fn track(&mut self, task: JoinHandle<()>) {
        self.0 = Some(task.map(|_| ()).boxed().shared());
    }

    async fn wait(self) {
        if let Some(task) = self.0 {
            task.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanCommand {
    Start,
    Stop,
}

/// Apply scan commands strictly in the order they were issued.
async fn run_scan_control<F, Fut>(mut commands: mpsc::UnboundedReceiver<ScanCommand>, mut apply: F)
where
    F: FnMut(ScanCommand) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(command) = commands.recv().await {
        apply(command).await;
    }
    trace!("Scan control stopped");
}

#[derive(Clone)]
struct Link {
    session: SessionId,
    peripheral: Peripheral,
}

struct Shared {
    adapter: Adapter,
    events: mpsc::UnboundedSender<RadioEvent>,
    /// Session of the current connect attempt or link.
    session: RwLock<Option<SessionId>>,
    link: RwLock<Option<Link>>,
    scan_target: RwLock<Option<DeviceId>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: RadioEvent) {
        if self.events.send(event).is_err() {
            trace!("Radio event receiver dropped");
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        *self.session.read() == Some(session)
    }

    fn peripheral_for(&self, session: SessionId) -> Result<Peripheral> {
        self.link
            .read()
            .as_ref()
            .filter(|link| link.session == session)
            .map(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    /// Drop the link if it belongs to `id`, returning its session.
    fn take_link_for(&self, id: &PeripheralId) -> Option<SessionId> {
        let mut link = self.link.write();
        if link.as_ref().map(|l| l.peripheral.id()) == Some(id.clone()) {
            link.take().map(|l| l.session)
        } else {
            None
        }
    }

    /// Peripheral of the current link if it belongs to `id`.
    fn linked_peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.link
            .read()
            .as_ref()
            .filter(|link| link.peripheral.id() == *id)
            .map(|link| link.peripheral.clone())
    }

    fn stop_listener(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

/// [`RadioLink`] on top of a btleplug [`Adapter`].
pub struct BtleplugRadio {
    shared: Arc<Shared>,
    runtime: Handle,
    connect_task: Option<JoinHandle<()>>,
    disconnecting: PendingDisconnect,
    scans: mpsc::UnboundedSender<ScanCommand>,
    scan_control: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Wrap `adapter`. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter's event stream cannot be opened.
    pub async fn new(adapter: Adapter) -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let events = adapter.events().await?;

        let shared = Arc::new(Shared {
            adapter,
            events: events_tx,
            session: RwLock::new(None),
            link: RwLock::new(None),
            scan_target: RwLock::new(None),
            listener: Mutex::new(None),
        });

        let watcher_shared = shared.clone();
        let watcher = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                Self::handle_event(event, &watcher_shared).await;
            }
            debug!("Adapter event stream ended");
        });

        let (scans, scan_commands) = mpsc::unbounded_channel();
        let scan_adapter = shared.adapter.clone();
        let scan_control = tokio::spawn(run_scan_control(scan_commands, move |command| {
            let adapter = scan_adapter.clone();
            async move {
                match command {
                    ScanCommand::Start => {
                        if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                            warn!("Wake scan start failed: {}", e);
                        }
                    }
                    ScanCommand::Stop => {
                        if let Err(e) = adapter.stop_scan().await {
                            debug!("Ignoring scan stop failure: {}", e);
                        }
                    }
                }
            }
        }));

        Ok((
            Self {
                shared,
                runtime: Handle::current(),
                connect_task: None,
                disconnecting: PendingDisconnect::default(),
                scans,
                scan_control,
                watcher,
            },
            events_rx,
        ))
    }

    /// The wrapped adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.shared.adapter
    }

    async fn handle_event(event: CentralEvent, shared: &Arc<Shared>) {
        match event {
            CentralEvent::DeviceDisconnected(id) => {
                let Some(peripheral) = shared.linked_peripheral(&id) else {
                    return;
                };
                // A late event for a link that was already replaced.
                if peripheral.is_connected().await.unwrap_or(false) {
                    debug!("Ignoring disconnect of {:?}, link is up", id);
                    return;
                }
                if let Some(session) = shared.take_link_for(&id) {
                    debug!("Peripheral {:?} disconnected", id);
                    shared.stop_listener();
                    shared.emit(RadioEvent::Disconnected {
                        session,
                        reason: Some("peripheral disconnected".to_string()),
                    });
                }
            }
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Some(target) = shared.scan_target.read().clone() else {
                    return;
                };
                let peripheral = match shared.adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Failed to get peripheral: {}", e);
                        return;
                    }
                };
                let address = peripheral.address().to_string();
                if target.matches(&address) {
                    trace!("Target {} advertising", address);
                    shared.emit(RadioEvent::Advertisement { address });
                }
            }
            CentralEvent::StateUpdate(state) => {
                if let Some(on) = adapter_powered(state) {
                    shared.emit(RadioEvent::AdapterPowered(on));
                }
            }
            _ => {}
        }
    }

    async fn find_peripheral(adapter: &Adapter, device: &DeviceId) -> Result<Peripheral> {
        adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| device.matches(&p.address().to_string()))
            .ok_or_else(|| Error::DeviceNotFound {
                address: device.to_string(),
            })
    }

    /// Look the peripheral up, giving a running scan time to report it.
    async fn wait_for_peripheral(adapter: &Adapter, device: &DeviceId) -> Result<Peripheral> {
        let deadline = Instant::now() + PERIPHERAL_WAIT;
        loop {
            match Self::find_peripheral(adapter, device).await {
                Err(Error::DeviceNotFound { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(PERIPHERAL_POLL).await;
                }
                found => return found,
            }
        }
    }

    async fn try_connect(adapter: &Adapter, device: &DeviceId) -> Result<Peripheral> {
        let peripheral = Self::wait_for_peripheral(adapter, device).await?;

        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
        } else {
            peripheral.connect().await?;
        }

        Ok(peripheral)
    }

    async fn run_connect(
        shared: Arc<Shared>,
        session: SessionId,
        device: DeviceId,
        auto_reconnect: bool,
        disconnecting: PendingDisconnect,
    ) {
        disconnecting.wait().await;
        if !shared.is_current(session) {
            return;
        }

        let max_attempts = if auto_reconnect {
            AUTO_RECONNECT_ATTEMPTS
        } else {
            1
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            debug!("Connection attempt {} of {} to {}", attempts, max_attempts, device);

            match Self::try_connect(&shared.adapter, &device).await {
                Ok(peripheral) => {
                    if !shared.is_current(session) {
                        debug!("Session {} superseded; dropping connection", session);
                        let _ = peripheral.disconnect().await;
                        return;
                    }
                    Self::start_listener(&shared, session, &peripheral).await;
                    *shared.link.write() = Some(Link {
                        session,
                        peripheral,
                    });
                    shared.emit(RadioEvent::Connected { session });
                    return;
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);
                    if attempts >= max_attempts || !shared.is_current(session) {
                        shared.emit(RadioEvent::Disconnected {
                            session,
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                    tokio::time::sleep(AUTO_RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn start_listener(shared: &Arc<Shared>, session: SessionId, peripheral: &Peripheral) {
        shared.stop_listener();

        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to get notification stream: {}", e);
                return;
            }
        };

        let listener_shared = shared.clone();
        let handle = tokio::spawn(async move {
            debug!("Notification listener started for session {}", session);
            while let Some(notification) = stream.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                listener_shared.emit(RadioEvent::Notification {
                    session,
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                });
            }
            debug!("Notification stream ended for session {}", session);
        });

        *shared.listener.lock() = Some(handle);
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.watcher.abort();
        self.scan_control.abort();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.shared.stop_listener();
    }
}

impl RadioLink for BtleplugRadio {
    fn connect(
        &mut self,
        session: SessionId,
        device: &DeviceId,
        auto_reconnect: bool,
    ) -> Result<()> {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        *self.shared.session.write() = Some(session);

        let task = Self::run_connect(
            self.shared.clone(),
            session,
            device.clone(),
            auto_reconnect,
            self.disconnecting.clone(),
        );
        self.connect_task = Some(self.runtime.spawn(task));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        *self.shared.session.write() = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.shared.stop_listener();

        let link = self.shared.link.write().take();
        if let Some(link) = link {
            let task = self.runtime.spawn(async move {
                if let Err(e) = link.peripheral.disconnect().await {
                    debug!("Ignoring disconnect failure: {}", e);
                }
            });
            self.disconnecting.track(task);
        }
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<()> {
        let peripheral = self.shared.peripheral_for(session)?;
        let shared = self.shared.clone();

        self.runtime.spawn(async move {
            let outcome = match peripheral.discover_services().await {
                Ok(()) => DiscoveryOutcome::Success(gatt_table(&peripheral.services())),
                Err(e) => DiscoveryOutcome::Failed(e.to_string()),
            };
            shared.emit(RadioEvent::ServicesDiscovered { session, outcome });
        });
        Ok(())
    }

    fn read_characteristic(&mut self, handle: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.shared.peripheral_for(handle.session)?;
        let shared = self.shared.clone();
        let handle = handle.clone();

        self.runtime.spawn(async move {
            let result = match find_characteristic(&peripheral, &handle) {
                Ok(characteristic) => peripheral
                    .read(&characteristic)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Ok(value) = &result {
                trace!("Read {} bytes from {}", value.len(), handle.characteristic);
            }
            shared.emit(RadioEvent::CharacteristicRead {
                session: handle.session,
                characteristic: handle.characteristic,
                result,
            });
        });
        Ok(())
    }

    fn subscribe(&mut self, handle: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.shared.peripheral_for(handle.session)?;
        let characteristic = find_characteristic(&peripheral, handle)?;

        self.runtime.spawn(async move {
            match peripheral.subscribe(&characteristic).await {
                Ok(()) => debug!("Subscribed to notifications from {}", characteristic.uuid),
                Err(e) => debug!("Failed to subscribe to {}: {:?}", characteristic.uuid, e),
            }
        });
        Ok(())
    }

    fn refresh_service_cache(&mut self) -> bool {
        debug!("Service cache refresh not available on this platform");
        false
    }

    fn start_scan(&mut self, device: &DeviceId, duration: Duration) -> Result<()> {
        *self.shared.scan_target.write() = Some(device.clone());

        trace!("Scanning for {} for up to {:?}", device, duration);
        self.scans
            .send(ScanCommand::Start)
            .map_err(|_| Error::ServiceStopped)
    }

    fn stop_scan(&mut self) -> Result<()> {
        *self.shared.scan_target.write() = None;
        self.scans
            .send(ScanCommand::Stop)
            .map_err(|_| Error::ServiceStopped)
    }

    fn request_mtu(&mut self, _mtu: u16) -> Result<()> {
        Err(Error::NotSupported {
            operation: "request_mtu".to_string(),
        })
    }

    fn request_high_priority(&mut self) -> Result<()> {
        Err(Error::NotSupported {
            operation: "request_high_priority".to_string(),
        })
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> Result<Characteristic> {
    let in_service: Vec<Characteristic> = peripheral
        .characteristics()
        .into_iter()
        .filter(|c| c.service_uuid == handle.service)
        .collect();

    if in_service.is_empty() {
        return Err(Error::ServiceNotFound {
            uuid: handle.service.to_string(),
        });
    }

    in_service
        .into_iter()
        .find(|c| c.uuid == handle.characteristic)
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: handle.characteristic.to_string(),
        })
}

/// Convert btleplug's service set into a [`GattTable`].
fn gatt_table(services: &BTreeSet<Service>) -> GattTable {
    GattTable::new(
        services
            .iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        properties: c.properties.bits(),
                    })
                    .collect(),
            })
            .collect(),
    )
}

fn adapter_powered(state: CentralState) -> Option<bool> {
    match state {
        CentralState::PoweredOn => Some(true),
        CentralState::PoweredOff => Some(false),
        _ => None,
    }
}
