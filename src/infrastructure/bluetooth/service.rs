//! Transport service: a single-owner task that serializes every mutation
//! of the protocol engine, device registry, and link session.
//!
//! The framing tick, watchdog tick, application commands, and BLE
//! callbacks all arrive as messages consumed one at a time by
//! [`LinkService::run`], so the single-writer invariant is structural.
//! Only the two application-facing byte queues are shared directly
//! (behind short-lived mutexes) so that pushes and pops stay O(1)
//! without a channel round trip.

use std::sync::{Arc, Mutex};

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::models::{ConnectionStatus, DiscoveredDevice, LinkEvent};
use crate::domain::settings::SettingsService;
use crate::error::LinkError;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::session::{self, LinkSession};
use crate::infrastructure::bluetooth::watchdog::{Watchdog, WatchdogAction};
use crate::transport::framing::{ChannelWriter, FrameEngine};
use crate::transport::protocol::{self, RESCAN_GRACE, TICK_PERIOD, WATCHDOG_PERIOD};
use crate::transport::queue::ByteQueue;

/// Application requests into the service loop.
enum Command {
    Connect(String),
    Disconnect,
    Shutdown,
}

/// Asynchronous BLE happenings fed back into the loop.
enum BleEvent {
    /// An establish task finished. `attempt` identifies which connect
    /// request spawned it; results from superseded attempts are discarded.
    SessionReady {
        attempt: u64,
        result: Result<LinkSession, LinkError>,
    },
    Notification { channel: usize, data: Vec<u8> },
    /// Lost the current session's peripheral (None), or the platform
    /// reported a specific peripheral disconnected.
    PeripheralLost(Option<PeripheralId>),
    RescanDue,
}

/// Non-blocking writer handed to the framing engine: payloads are queued
/// for an async task doing the actual characteristic writes.
struct QueuedWriter<'a> {
    tx: Option<&'a mpsc::UnboundedSender<(usize, Vec<u8>)>>,
}

impl ChannelWriter for QueuedWriter<'_> {
    fn write(&mut self, channel: usize, payload: &[u8]) -> Result<(), LinkError> {
        let tx = self.tx.ok_or(LinkError::NotConnected)?;
        tx.send((channel, payload.to_vec()))
            .map_err(|_| LinkError::NotConnected)
    }
}

pub struct LinkService {
    adapter: Adapter,
    registry: Arc<Mutex<DeviceRegistry<Peripheral>>>,
    settings: Arc<Mutex<SettingsService>>,
    engine: FrameEngine,
    watchdog: Watchdog,
    session: Option<LinkSession>,
    writer_tx: Option<mpsc::UnboundedSender<(usize, Vec<u8>)>>,
    status: ConnectionStatus,
    scanning: bool,
    /// Device a pending connect attempt targets, for stall retries.
    pending_device: Option<String>,
    /// Generation counter for connect attempts; each new attempt
    /// invalidates any establish task still in flight.
    attempt: u64,
    outbound: Arc<Mutex<ByteQueue>>,
    inbound: Arc<Mutex<ByteQueue>>,
    event_tx: broadcast::Sender<LinkEvent>,
    ble_tx: mpsc::UnboundedSender<BleEvent>,
}

impl LinkService {
    /// Initialize the BLE stack and start the service loop.
    pub async fn spawn(settings: Arc<Mutex<SettingsService>>) -> anyhow::Result<LinkHandle> {
        let adapter_index = settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .get()
            .adapter_index;

        let manager = Manager::new().await?;
        let adapter = pick_adapter(&manager, adapter_index).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ble_tx, ble_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);
        let outbound = Arc::new(Mutex::new(ByteQueue::new()));
        let inbound = Arc::new(Mutex::new(ByteQueue::new()));
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));

        spawn_central_event_task(adapter.clone(), ble_tx.clone());

        let service = LinkService {
            adapter,
            registry: registry.clone(),
            settings: settings.clone(),
            engine: FrameEngine::new(),
            watchdog: Watchdog::new(),
            session: None,
            writer_tx: None,
            status: ConnectionStatus::Disconnected,
            scanning: false,
            pending_device: None,
            attempt: 0,
            outbound: outbound.clone(),
            inbound: inbound.clone(),
            event_tx: event_tx.clone(),
            ble_tx,
        };
        tokio::spawn(service.run(cmd_rx, ble_rx));

        Ok(LinkHandle {
            cmd_tx,
            outbound,
            inbound,
            event_tx,
            registry,
            settings,
        })
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut ble_rx: mpsc::UnboundedReceiver<BleEvent>,
    ) {
        let mut engine_tick = tokio::time::interval(TICK_PERIOD);
        engine_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog_tick = tokio::time::interval(WATCHDOG_PERIOD);
        watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.start_scan().await;
        info!("transport service running");

        loop {
            tokio::select! {
                _ = engine_tick.tick() => self.on_engine_tick(),
                _ = watchdog_tick.tick() => self.on_watchdog_tick().await,
                command = cmd_rx.recv() => match command {
                    Some(Command::Connect(name)) => self.connect(name).await,
                    Some(Command::Disconnect) => self.disconnect().await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = ble_rx.recv() => self.on_ble_event(event).await,
            }
        }

        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
        info!("transport service stopped");
    }

    /// One framing-engine step. Must stay non-blocking: queue locks are
    /// held only for the duration of the state transition.
    fn on_engine_tick(&mut self) {
        let connected = self.status == ConnectionStatus::Connected;
        let Ok(mut outbound) = self.outbound.lock() else {
            return;
        };
        let Ok(mut inbound) = self.inbound.lock() else {
            return;
        };
        let mut writer = QueuedWriter {
            tx: self.writer_tx.as_ref(),
        };
        self.engine
            .tick(connected, &mut outbound, &mut inbound, &mut writer);
    }

    async fn on_watchdog_tick(&mut self) {
        if self.status == ConnectionStatus::Connected {
            return;
        }
        match self.watchdog.on_tick() {
            WatchdogAction::Idle => {}
            WatchdogAction::RefreshScan => {
                // Toggling the scan forces the platform to report fresh
                // RSSI values for already-known peripherals.
                if self.scanning {
                    self.stop_scan().await;
                    self.start_scan().await;
                }
                self.poll_discovered().await;
                let crossed = self
                    .registry
                    .lock()
                    .map(|mut registry| registry.age_all())
                    .unwrap_or(false);
                if crossed {
                    let _ = self.event_tx.send(LinkEvent::DeviceListChanged);
                }
            }
            WatchdogAction::RestartManager => {
                warn!("connection attempt stalled, reinitializing BLE manager");
                self.restart_manager().await;
            }
        }
    }

    /// Read the adapter's peripheral list into the registry, raising a
    /// list-changed event for accepted discoveries and auto-connecting to
    /// the persisted device when it reappears.
    async fn poll_discovered(&mut self) {
        let Ok(peripherals) = self.adapter.peripherals().await else {
            return;
        };

        let (last_selected, auto_connect) = match self.settings.lock() {
            Ok(settings) => (settings.last_selected(), settings.get().auto_connect),
            Err(_) => return,
        };
        let pending = self.pending_device.clone();

        let mut changed = false;
        let mut reconnect: Option<String> = None;
        for peripheral in peripherals {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = properties.local_name else {
                continue;
            };
            let Some(rssi) = properties.rssi else {
                continue;
            };

            let accepted = self
                .registry
                .lock()
                .map(|mut registry| registry.on_discovered(&name, peripheral, rssi))
                .unwrap_or(false);
            if accepted {
                changed = true;
                if should_reconnect(&name, pending.as_deref(), &last_selected, auto_connect) {
                    reconnect = Some(name);
                }
            }
        }

        if changed {
            let _ = self.event_tx.send(LinkEvent::DeviceListChanged);
        }
        if self.status == ConnectionStatus::Disconnected {
            if let Some(name) = reconnect {
                debug!(device = %name, "auto-connecting to last selected device");
                self.connect(name).await;
            }
        }
    }

    /// Select a device for connection; an empty name disconnects.
    async fn connect(&mut self, name: String) {
        if let Ok(mut settings) = self.settings.lock() {
            if let Err(error) = settings.persist_selected(&name) {
                warn!(%error, "failed to persist selected device");
            }
        }

        if name.is_empty() {
            self.disconnect().await;
            return;
        }

        let Some(peripheral) = self
            .registry
            .lock()
            .ok()
            .and_then(|registry| registry.peripheral_for(&name))
        else {
            // Selected device is no longer in the registry: no-op.
            debug!(device = %name, "connect requested for unknown device");
            return;
        };

        if self.session.is_some() {
            self.teardown_session().await;
        }

        info!(device = %name, "connecting");
        self.stop_scan().await;
        self.status = ConnectionStatus::Connecting;
        self.watchdog.connect_started();
        self.pending_device = Some(name);
        self.attempt = self.attempt.wrapping_add(1);
        let attempt = self.attempt;

        let ble_tx = self.ble_tx.clone();
        tokio::spawn(async move {
            let result = session::establish(peripheral).await;
            let _ = ble_tx.send(BleEvent::SessionReady { attempt, result });
        });
    }

    async fn disconnect(&mut self) {
        self.teardown_session().await;
        self.pending_device = None;
        self.status = ConnectionStatus::Disconnected;
        self.watchdog.connect_ended();
        let _ = self.event_tx.send(LinkEvent::Disconnected);
        self.schedule_rescan();
    }

    async fn teardown_session(&mut self) {
        self.writer_tx = None;
        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
    }

    async fn on_ble_event(&mut self, event: BleEvent) {
        match event {
            BleEvent::SessionReady { attempt, result } => {
                if !attempt_is_current(self.attempt, attempt, self.status) {
                    // Superseded by a newer connect, or the user
                    // disconnected meanwhile; a session from it must not
                    // be kept half-open.
                    if let Ok(session) = result {
                        session.teardown().await;
                    }
                    return;
                }
                match result {
                    Ok(session) => self.on_session_established(session).await,
                    Err(error) => {
                        warn!(%error, "connection attempt failed");
                        self.status = ConnectionStatus::Disconnected;
                        self.watchdog.connect_ended();
                        self.pending_device = None;
                        let _ = self.event_tx.send(LinkEvent::Disconnected);
                        self.schedule_rescan();
                    }
                }
            }
            BleEvent::Notification { channel, data } => {
                self.engine.on_notification(channel, &data);
            }
            BleEvent::PeripheralLost(id) => {
                if self.status == ConnectionStatus::Disconnected {
                    return;
                }
                if let Some(id) = id {
                    let matches = self
                        .session
                        .as_ref()
                        .map(|session| session.peripheral().id() == id)
                        .unwrap_or(false);
                    if !matches {
                        return;
                    }
                }
                warn!("peripheral lost");
                self.disconnect().await;
            }
            BleEvent::RescanDue => {
                if self.status == ConnectionStatus::Disconnected && !self.scanning {
                    self.start_scan().await;
                }
            }
        }
    }

    async fn on_session_established(&mut self, session: LinkSession) {
        if let Err(error) = self.spawn_notification_task(&session).await {
            warn!(%error, "failed to open notification stream");
            session.teardown().await;
            self.status = ConnectionStatus::Disconnected;
            self.watchdog.connect_ended();
            let _ = self.event_tx.send(LinkEvent::Disconnected);
            self.schedule_rescan();
            return;
        }
        self.writer_tx = Some(self.spawn_writer_task(session.clone()));
        self.session = Some(session);
        self.status = ConnectionStatus::Connected;
        self.watchdog.connect_ended();
        self.pending_device = None;
        info!("connected");
        let _ = self.event_tx.send(LinkEvent::Connected);
    }

    /// Writes queued by the framing tick are drained here, off the tick
    /// path. The first failed write drops the link.
    fn spawn_writer_task(&self, session: LinkSession) -> mpsc::UnboundedSender<(usize, Vec<u8>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Vec<u8>)>();
        let ble_tx = self.ble_tx.clone();
        tokio::spawn(async move {
            while let Some((channel, payload)) = rx.recv().await {
                if let Err(error) = session.write(channel, &payload).await {
                    warn!(channel, %error, "characteristic write failed");
                    let _ = ble_tx.send(BleEvent::PeripheralLost(None));
                    break;
                }
            }
        });
        tx
    }

    /// Forward characteristic notifications into the loop, mapping UUIDs
    /// back to channel indices. Stream end means the peripheral is gone.
    async fn spawn_notification_task(&self, session: &LinkSession) -> Result<(), LinkError> {
        let mut stream = session.peripheral().notifications().await?;
        let ble_tx = self.ble_tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if let Some(channel) = protocol::channel_for_uuid(&notification.uuid) {
                    let _ = ble_tx.send(BleEvent::Notification {
                        channel,
                        data: notification.value,
                    });
                }
            }
            let _ = ble_tx.send(BleEvent::PeripheralLost(None));
        });
        Ok(())
    }

    fn schedule_rescan(&self) {
        let ble_tx = self.ble_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESCAN_GRACE).await;
            let _ = ble_tx.send(BleEvent::RescanDue);
        });
    }

    async fn start_scan(&mut self) {
        let filter = ScanFilter {
            services: vec![protocol::SERVICE_UUID],
        };
        match self.adapter.start_scan(filter).await {
            Ok(()) => self.scanning = true,
            Err(error) => warn!(%error, "failed to start scan"),
        }
    }

    async fn stop_scan(&mut self) {
        if let Err(error) = self.adapter.stop_scan().await {
            debug!(%error, "failed to stop scan");
        }
        self.scanning = false;
    }

    /// Workaround for platform connection stalls: throw away the manager
    /// and build a fresh one. Peripheral handles are tied to the adapter
    /// that produced them, so the registry is emptied too; the pending
    /// device reconnects through the normal rediscovery path once the
    /// new adapter's scan sees it again.
    async fn restart_manager(&mut self) {
        let adapter_index = self
            .settings
            .lock()
            .map(|settings| settings.get().adapter_index)
            .unwrap_or(0);

        match Manager::new().await {
            Ok(manager) => match pick_adapter(&manager, adapter_index).await {
                Ok(adapter) => {
                    self.adapter = adapter;
                    self.scanning = false;
                    spawn_central_event_task(self.adapter.clone(), self.ble_tx.clone());
                }
                Err(error) => {
                    warn!(%error, "no adapter after manager restart");
                    return;
                }
            },
            Err(error) => {
                warn!(%error, "manager reinitialization failed");
                return;
            }
        }

        self.status = ConnectionStatus::Disconnected;
        self.watchdog.connect_ended();
        self.attempt = self.attempt.wrapping_add(1);
        if let Ok(mut registry) = self.registry.lock() {
            registry.clear();
        }
        let _ = self.event_tx.send(LinkEvent::DeviceListChanged);
        self.start_scan().await;
    }
}

/// Whether a finished establish attempt is the one still pending.
///
/// `SessionReady` events carry the attempt generation that spawned them;
/// anything but the latest generation while still `Connecting` belongs to
/// a superseded connect and must be discarded.
fn attempt_is_current(current: u64, attempt: u64, status: ConnectionStatus) -> bool {
    status == ConnectionStatus::Connecting && attempt == current
}

/// Whether a freshly accepted discovery should trigger a connect: either
/// a stalled attempt is waiting for this device to reappear, or it is the
/// persisted selection and auto-connect is on.
fn should_reconnect(
    name: &str,
    pending: Option<&str>,
    last_selected: &str,
    auto_connect: bool,
) -> bool {
    if pending == Some(name) {
        return true;
    }
    auto_connect && !last_selected.is_empty() && name == last_selected
}

async fn pick_adapter(manager: &Manager, index: usize) -> Result<Adapter, LinkError> {
    let mut adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(LinkError::NoAdapter);
    }
    let index = index.min(adapters.len() - 1);
    Ok(adapters.remove(index))
}

/// Surface platform disconnect notifications as loop events.
fn spawn_central_event_task(adapter: Adapter, ble_tx: mpsc::UnboundedSender<BleEvent>) {
    tokio::spawn(async move {
        let Ok(mut events) = adapter.events().await else {
            return;
        };
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                let _ = ble_tx.send(BleEvent::PeripheralLost(Some(id)));
            }
        }
    });
}

/// Application-facing handle to the running transport.
///
/// `send` and the inbound accessors touch only the shared byte queues;
/// everything else is a message to the service loop.
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    outbound: Arc<Mutex<ByteQueue>>,
    inbound: Arc<Mutex<ByteQueue>>,
    event_tx: broadcast::Sender<LinkEvent>,
    registry: Arc<Mutex<DeviceRegistry<Peripheral>>>,
    settings: Arc<Mutex<SettingsService>>,
}

impl LinkHandle {
    /// Queue bytes for transmission; the framing engine drains them up to
    /// 119 bytes per round while connected.
    pub fn send(&self, bytes: &[u8]) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.extend(bytes);
        }
    }

    /// Pop one reassembled inbound byte, if any.
    pub fn try_recv(&self) -> Option<u8> {
        self.inbound
            .lock()
            .ok()
            .and_then(|mut inbound| inbound.pop())
    }

    /// Drain everything currently reassembled.
    pub fn drain_inbound(&self) -> Vec<u8> {
        let Ok(mut inbound) = self.inbound.lock() else {
            return Vec::new();
        };
        std::iter::from_fn(|| inbound.pop()).collect()
    }

    /// Connect to a scanned device by name; an empty name disconnects.
    pub fn connect(&self, name: &str) {
        let _ = self.cmd_tx.send(Command::Connect(name.to_string()));
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of devices currently visible, sorted by name.
    pub fn active_devices(&self) -> Vec<DiscoveredDevice> {
        let Ok(registry) = self.registry.lock() else {
            return Vec::new();
        };
        let mut devices: Vec<DiscoveredDevice> = registry
            .active_devices()
            .into_values()
            .map(|record| DiscoveredDevice {
                signal_scale: record.rssi_scale(100),
                rssi: record.rssi,
                name: record.name,
            })
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn last_selected(&self) -> String {
        self.settings
            .lock()
            .map(|settings| settings.last_selected())
            .unwrap_or_default()
    }

    pub fn persist_selected(&self, name: &str) -> anyhow::Result<()> {
        self.settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .persist_selected(name)
    }
}
