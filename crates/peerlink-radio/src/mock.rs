//! In-memory radio backends for testing and simulation.
//!
//! A [`MockAir`] is the shared medium; every [`MockRadio`] attached to it is
//! one device. Advertisements reach every other device that is scanning,
//! GATT writes reach the target device's GATT server, discoverable devices
//! show up in other devices' inquiries, and socket connections become
//! in-memory duplex pipes to the target's listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_types::BluetoothAddress;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::RadioError;
use crate::{
    AdvertiseSettings, AdvertisementData, BleAdapter, BluetoothSockets, BoxedStream,
    ClassicBluetooth, GattWrite, Radios, ScanFilter, ScanRecord, ScanSettings, SocketListener,
    WifiDirect, WifiEvent,
};

const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = (BoxedStream, BluetoothAddress);

// ---------------------------------------------------------------------------
// MockAir
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceState {
    wifi_address: String,
    advertisement: Option<AdvertisementData>,
    scanner: Option<(ScanFilter, mpsc::UnboundedSender<ScanRecord>)>,
    gatt_server: Option<(Uuid, Uuid, mpsc::UnboundedSender<GattWrite>)>,
    inquiry: Option<mpsc::UnboundedSender<BluetoothAddress>>,
    discoverable: bool,
    listener: Option<(u64, mpsc::UnboundedSender<Incoming>)>,
    wifi_discovery: Option<mpsc::UnboundedSender<WifiEvent>>,
    wifi_service: Option<(String, String)>,
}

#[derive(Default)]
struct AirState {
    devices: HashMap<BluetoothAddress, DeviceState>,
}

impl AirState {
    fn device(&mut self, address: BluetoothAddress) -> &mut DeviceState {
        self.devices.entry(address).or_default()
    }

    fn others(
        &self,
        address: BluetoothAddress,
    ) -> impl Iterator<Item = (&BluetoothAddress, &DeviceState)> {
        self.devices.iter().filter(move |(a, _)| **a != address)
    }

    fn wifi_advertisers(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.wifi_service.is_some())
            .map(|d| d.wifi_address.clone())
            .collect();
        addresses.sort();
        addresses
    }
}

/// Shared in-memory radio medium.
#[derive(Clone, Default)]
pub struct MockAir {
    state: Arc<Mutex<AirState>>,
    next_listener: Arc<AtomicU64>,
}

impl MockAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new device with the given hardware address.
    pub fn device(&self, address: BluetoothAddress) -> Arc<MockRadio> {
        let wifi_address = format!("wifi-{address}");
        self.state.lock().device(address).wifi_address = wifi_address;
        Arc::new(MockRadio {
            air: self.clone(),
            address,
            knobs: Mutex::new(Knobs::default()),
            counters: MockCounters::default(),
        })
    }

    /// Deliver every current advertisement to every matching scanner again,
    /// as periodic advertising would.
    pub fn rebroadcast(&self) {
        let state = self.state.lock();
        for (address, device) in &state.devices {
            if let Some(data) = &device.advertisement {
                for (_, other) in state.others(*address) {
                    deliver_advertisement(*address, data, other);
                }
            }
        }
    }
}

/// BLE advertisements go out under a private address derived from the
/// hardware address.
pub fn private_address(address: BluetoothAddress) -> BluetoothAddress {
    let mut octets = address.octets();
    octets[0] |= 0xc0;
    BluetoothAddress::new(octets)
}

fn deliver_advertisement(from: BluetoothAddress, data: &AdvertisementData, to: &DeviceState) {
    if let Some((filter, tx)) = &to.scanner {
        if filter.matches(data) {
            let _ = tx.send(ScanRecord {
                device_address: private_address(from),
                data: data.clone(),
                rssi: Some(-60),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// MockRadio
// ---------------------------------------------------------------------------

/// Failure injection and capability switches for one mock device.
#[derive(Debug, Clone)]
pub struct Knobs {
    pub bluetooth_enabled: bool,
    pub wifi_enabled: bool,
    pub hide_local_address: bool,
    pub multi_advertisement_supported: bool,
    /// Number of upcoming `start_advertising` calls that fail.
    pub fail_advertise_starts: usize,
    /// Number of upcoming `start_scanning` calls that fail.
    pub fail_scan_starts: usize,
    /// Number of upcoming `discover_peers` calls that fail.
    pub fail_wifi_starts: usize,
    /// Number of upcoming `listen` calls that fail.
    pub fail_listens: usize,
    /// Refuse every outgoing connection.
    pub refuse_connections: bool,
    /// Delay before an outgoing connection completes.
    pub connect_delay: Duration,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            bluetooth_enabled: true,
            wifi_enabled: true,
            hide_local_address: false,
            multi_advertisement_supported: true,
            fail_advertise_starts: 0,
            fail_scan_starts: 0,
            fail_wifi_starts: 0,
            fail_listens: 0,
            refuse_connections: false,
            connect_delay: Duration::ZERO,
        }
    }
}

/// Call counters for observing what the code under test asked the radio to do.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub advertise_starts: AtomicUsize,
    pub advertise_stops: AtomicUsize,
    pub scan_starts: AtomicUsize,
    pub scan_stops: AtomicUsize,
    pub gatt_server_starts: AtomicUsize,
    pub gatt_server_stops: AtomicUsize,
    pub gatt_writes: AtomicUsize,
    pub device_discovery_starts: AtomicUsize,
    pub device_discovery_stops: AtomicUsize,
    pub discoverable_requests: AtomicUsize,
    pub wifi_discovery_starts: AtomicUsize,
    pub wifi_advertise_starts: AtomicUsize,
    pub listens: AtomicUsize,
    pub connects: AtomicUsize,
}

impl MockCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// One simulated device implementing every radio trait.
pub struct MockRadio {
    air: MockAir,
    address: BluetoothAddress,
    knobs: Mutex<Knobs>,
    pub counters: MockCounters,
}

impl MockRadio {
    /// The hardware address, regardless of whether it is hidden.
    pub fn address(&self) -> BluetoothAddress {
        self.address
    }

    pub fn wifi_address(&self) -> String {
        self.air.state.lock().device(self.address).wifi_address.clone()
    }

    /// Adjust knobs in place.
    pub fn configure(&self, f: impl FnOnce(&mut Knobs)) {
        f(&mut self.knobs.lock());
    }

    pub fn knobs(&self) -> Knobs {
        self.knobs.lock().clone()
    }

    pub fn radios(self: &Arc<Self>) -> Radios {
        Radios {
            ble: Arc::clone(self) as Arc<dyn BleAdapter>,
            classic: Arc::clone(self) as Arc<dyn ClassicBluetooth>,
            sockets: Arc::clone(self) as Arc<dyn BluetoothSockets>,
            wifi: Arc::clone(self) as Arc<dyn WifiDirect>,
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.air.state.lock().device(self.address).advertisement.is_some()
    }

    pub fn current_advertisement(&self) -> Option<AdvertisementData> {
        self.air.state.lock().device(self.address).advertisement.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.air.state.lock().device(self.address).scanner.is_some()
    }

    pub fn is_gatt_server_running(&self) -> bool {
        self.air.state.lock().device(self.address).gatt_server.is_some()
    }

    pub fn is_discovering_devices(&self) -> bool {
        self.air.state.lock().device(self.address).inquiry.is_some()
    }

    pub fn is_discoverable(&self) -> bool {
        self.air.state.lock().device(self.address).discoverable
    }

    pub fn is_listening(&self) -> bool {
        self.air.state.lock().device(self.address).listener.is_some()
    }

    pub fn is_wifi_discovering(&self) -> bool {
        self.air.state.lock().device(self.address).wifi_discovery.is_some()
    }

    pub fn wifi_service(&self) -> Option<(String, String)> {
        self.air.state.lock().device(self.address).wifi_service.clone()
    }

    /// Simulate an inbound GATT write from `from` without a second device.
    pub fn inject_gatt_write(&self, from: BluetoothAddress, value: &[u8]) -> bool {
        let mut state = self.air.state.lock();
        let device = state.device(self.address);
        match &device.gatt_server {
            Some((_, characteristic, tx)) => tx
                .send(GattWrite {
                    device: from,
                    characteristic: *characteristic,
                    value: value.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulate a scan result arriving from the air.
    pub fn inject_scan_record(&self, record: ScanRecord) -> bool {
        let mut state = self.air.state.lock();
        match &state.device(self.address).scanner {
            Some((_, tx)) => tx.send(record).is_ok(),
            None => false,
        }
    }

    /// Simulate a classic inquiry result.
    pub fn inject_discovered_device(&self, address: BluetoothAddress) -> bool {
        let mut state = self.air.state.lock();
        match &state.device(self.address).inquiry {
            Some(tx) => tx.send(address).is_ok(),
            None => false,
        }
    }

    fn take_failure(&self, pick: impl FnOnce(&mut Knobs) -> &mut usize) -> bool {
        let mut knobs = self.knobs.lock();
        let remaining = pick(&mut knobs);
        if *remaining > 0 {
            *remaining -= 1;
            debug!(device = %self.address, remaining = *remaining, "injecting radio failure");
            true
        } else {
            false
        }
    }
}

impl BleAdapter for MockRadio {
    fn is_enabled(&self) -> bool {
        self.knobs.lock().bluetooth_enabled
    }

    fn is_multi_advertisement_supported(&self) -> bool {
        self.knobs.lock().multi_advertisement_supported
    }

    fn start_advertising(
        &self,
        data: &AdvertisementData,
        _settings: &AdvertiseSettings,
    ) -> Result<(), RadioError> {
        self.counters.advertise_starts.fetch_add(1, Ordering::SeqCst);
        if !self.is_multi_advertisement_supported() {
            return Err(RadioError::Advertise("multi-advertisement unsupported".to_string()));
        }
        if self.take_failure(|k| &mut k.fail_advertise_starts) {
            return Err(RadioError::Advertise("injected failure".to_string()));
        }
        let mut state = self.air.state.lock();
        state.device(self.address).advertisement = Some(data.clone());
        for (_, other) in state.others(self.address) {
            deliver_advertisement(self.address, data, other);
        }
        Ok(())
    }

    fn stop_advertising(&self) {
        self.counters.advertise_stops.fetch_add(1, Ordering::SeqCst);
        self.air.state.lock().device(self.address).advertisement = None;
    }

    fn start_scanning(
        &self,
        filter: &ScanFilter,
        _settings: &ScanSettings,
        results: mpsc::UnboundedSender<ScanRecord>,
    ) -> Result<(), RadioError> {
        self.counters.scan_starts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure(|k| &mut k.fail_scan_starts) {
            return Err(RadioError::Scan("injected failure".to_string()));
        }
        let mut state = self.air.state.lock();
        state.device(self.address).scanner = Some((*filter, results));
        let me = &state.devices[&self.address];
        for (address, other) in state.others(self.address) {
            if let Some(data) = &other.advertisement {
                deliver_advertisement(*address, data, me);
            }
        }
        Ok(())
    }

    fn stop_scanning(&self) {
        self.counters.scan_stops.fetch_add(1, Ordering::SeqCst);
        self.air.state.lock().device(self.address).scanner = None;
    }

    fn start_gatt_server(
        &self,
        service: Uuid,
        characteristic: Uuid,
        writes: mpsc::UnboundedSender<GattWrite>,
    ) -> Result<(), RadioError> {
        self.counters.gatt_server_starts.fetch_add(1, Ordering::SeqCst);
        self.air.state.lock().device(self.address).gatt_server =
            Some((service, characteristic, writes));
        Ok(())
    }

    fn stop_gatt_server(&self) {
        self.counters.gatt_server_stops.fetch_add(1, Ordering::SeqCst);
        self.air.state.lock().device(self.address).gatt_server = None;
    }

    fn write_characteristic(
        &self,
        device: BluetoothAddress,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.counters.gatt_writes.fetch_add(1, Ordering::SeqCst);
        let state = self.air.state.lock();
        let target = state
            .devices
            .get(&device)
            .ok_or_else(|| RadioError::Gatt(format!("no device {device}")))?;
        match &target.gatt_server {
            Some((s, c, tx)) if *s == service && *c == characteristic => {
                tx.send(GattWrite {
                    device: self.address,
                    characteristic,
                    value: value.to_vec(),
                })
                .map_err(|_| RadioError::Gatt("GATT server closed".to_string()))
            }
            _ => Err(RadioError::Gatt(format!("{device} exposes no matching characteristic"))),
        }
    }
}

impl ClassicBluetooth for MockRadio {
    fn is_enabled(&self) -> bool {
        self.knobs.lock().bluetooth_enabled
    }

    fn local_address(&self) -> Option<BluetoothAddress> {
        (!self.knobs.lock().hide_local_address).then_some(self.address)
    }

    fn start_device_discovery(
        &self,
        _timeout: Duration,
        found: mpsc::UnboundedSender<BluetoothAddress>,
    ) -> Result<(), RadioError> {
        self.counters
            .device_discovery_starts
            .fetch_add(1, Ordering::SeqCst);
        let mut state = self.air.state.lock();
        for (address, other) in state.others(self.address) {
            if other.discoverable {
                let _ = found.send(*address);
            }
        }
        state.device(self.address).inquiry = Some(found);
        Ok(())
    }

    fn stop_device_discovery(&self) {
        self.counters
            .device_discovery_stops
            .fetch_add(1, Ordering::SeqCst);
        self.air.state.lock().device(self.address).inquiry = None;
    }

    fn make_discoverable(&self, _duration: Duration) -> Result<(), RadioError> {
        self.counters
            .discoverable_requests
            .fetch_add(1, Ordering::SeqCst);
        let mut state = self.air.state.lock();
        state.device(self.address).discoverable = true;
        for (_, other) in state.others(self.address) {
            if let Some(tx) = &other.inquiry {
                let _ = tx.send(self.address);
            }
        }
        Ok(())
    }
}

/// Listener half of a mock socket pair.
pub struct MockListener {
    air: MockAir,
    address: BluetoothAddress,
    id: u64,
    incoming: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl SocketListener for MockListener {
    async fn accept(&mut self) -> Result<(BoxedStream, BluetoothAddress), RadioError> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| RadioError::Listen("listener closed".to_string()))
    }

    async fn close(&mut self) {
        let mut state = self.air.state.lock();
        let device = state.device(self.address);
        if device.listener.as_ref().is_some_and(|(id, _)| *id == self.id) {
            device.listener = None;
        }
        self.incoming.close();
    }
}

#[async_trait]
impl BluetoothSockets for MockRadio {
    async fn listen(
        &self,
        _service: Uuid,
        _name: &str,
        _port: Option<u8>,
    ) -> Result<Box<dyn SocketListener>, RadioError> {
        self.counters.listens.fetch_add(1, Ordering::SeqCst);
        if self.take_failure(|k| &mut k.fail_listens) {
            return Err(RadioError::Listen("injected failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.air.next_listener.fetch_add(1, Ordering::SeqCst);
        self.air.state.lock().device(self.address).listener = Some((id, tx));
        Ok(Box::new(MockListener {
            air: self.air.clone(),
            address: self.address,
            id,
            incoming: rx,
        }))
    }

    async fn connect(
        &self,
        address: BluetoothAddress,
        _service: Uuid,
        _port: Option<u8>,
    ) -> Result<BoxedStream, RadioError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let (refuse, delay) = {
            let knobs = self.knobs.lock();
            (knobs.refuse_connections, knobs.connect_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            return Err(RadioError::ConnectionRefused(address));
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let state = self.air.state.lock();
        let listener = state
            .devices
            .get(&address)
            .and_then(|d| d.listener.as_ref())
            .ok_or(RadioError::ConnectionRefused(address))?;
        listener
            .1
            .send((Box::new(remote), self.address))
            .map_err(|_| RadioError::ConnectionRefused(address))?;
        Ok(Box::new(local))
    }
}

impl WifiDirect for MockRadio {
    fn is_enabled(&self) -> bool {
        self.knobs.lock().wifi_enabled
    }

    fn discover_peers(&self, events: mpsc::UnboundedSender<WifiEvent>) -> Result<(), RadioError> {
        self.counters
            .wifi_discovery_starts
            .fetch_add(1, Ordering::SeqCst);
        if self.take_failure(|k| &mut k.fail_wifi_starts) {
            return Err(RadioError::WifiDirect("injected failure".to_string()));
        }
        let mut state = self.air.state.lock();
        let _ = events.send(WifiEvent::PeersChanged(
            state
                .wifi_advertisers()
                .into_iter()
                .filter(|a| *a != state.devices[&self.address].wifi_address)
                .collect(),
        ));
        for (_, other) in state.others(self.address) {
            if let Some((instance_name, service_type)) = &other.wifi_service {
                let _ = events.send(WifiEvent::ServiceFound {
                    instance_name: instance_name.clone(),
                    service_type: service_type.clone(),
                    device_address: other.wifi_address.clone(),
                });
            }
        }
        state.device(self.address).wifi_discovery = Some(events);
        Ok(())
    }

    fn stop_discovery(&self) {
        self.air.state.lock().device(self.address).wifi_discovery = None;
    }

    fn advertise_service(
        &self,
        instance_name: &str,
        service_type: &str,
        _record: &HashMap<String, String>,
    ) -> Result<(), RadioError> {
        self.counters
            .wifi_advertise_starts
            .fetch_add(1, Ordering::SeqCst);
        let mut state = self.air.state.lock();
        let device = state.device(self.address);
        device.wifi_service = Some((instance_name.to_string(), service_type.to_string()));
        let wifi_address = device.wifi_address.clone();
        let advertisers = state.wifi_advertisers();
        for (_, other) in state.others(self.address) {
            if let Some(tx) = &other.wifi_discovery {
                let visible = advertisers
                    .iter()
                    .filter(|a| **a != other.wifi_address)
                    .cloned()
                    .collect();
                let _ = tx.send(WifiEvent::PeersChanged(visible));
                let _ = tx.send(WifiEvent::ServiceFound {
                    instance_name: instance_name.to_string(),
                    service_type: service_type.to_string(),
                    device_address: wifi_address.clone(),
                });
            }
        }
        Ok(())
    }

    fn stop_advertising(&self) {
        let mut state = self.air.state.lock();
        state.device(self.address).wifi_service = None;
        let advertisers = state.wifi_advertisers();
        for (_, other) in state.others(self.address) {
            if let Some(tx) = &other.wifi_discovery {
                let visible = advertisers
                    .iter()
                    .filter(|a| **a != other.wifi_address)
                    .cloned()
                    .collect();
                let _ = tx.send(WifiEvent::PeersChanged(visible));
            }
        }
    }
}
