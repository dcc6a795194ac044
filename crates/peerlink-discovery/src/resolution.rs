//! Bluetooth address resolution.
//!
//! A device whose own classic Bluetooth address is hidden asks a neighbour
//! to tell it. The neighbour (provider) runs a classic inquiry, and writes
//! each discovered device's address into that device's GATT
//! characteristic. The asking device (requester) validates the write and
//! adopts the address.
//!
//! Each role has at most one session at a time. Inquiry results arrive on a
//! pump task and are checked against the provide session they were started
//! for, so a late result from a torn-down session is ignored.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use peerlink_radio::{GattWrite, Radios};
use peerlink_types::BluetoothAddress;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advertisement::{self, PeerAdvertisement};
use crate::request_id::derive_request_uuid;
use crate::settings::{DiscoverySettings, DEVICE_DISCOVERY_TIMEOUT};
use crate::timer::Timer;

/// Outcomes reported upward by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionEvent {
    /// A provider wrote our address; the requester session is over.
    AddressResolved {
        request_id: String,
        address: BluetoothAddress,
    },
    /// The requester deadline passed without a valid write.
    ResolutionFailed { request_id: String },
    /// A provider session ended; the BLE scan it suspended may resume.
    ProvidingStopped { request_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderState {
    #[default]
    Idle,
    Providing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequesterState {
    #[default]
    Idle,
    WaitingForAddress(String),
}

#[derive(Default)]
struct Inner {
    provider: ProviderState,
    requester: RequesterState,
    /// Bumped whenever a provide session starts or ends.
    provide_session: u64,
    provide_timer: Timer,
    receive_timer: Timer,
    inquiry_task: Option<JoinHandle<()>>,
    gatt_task: Option<JoinHandle<()>>,
    gatt_server_running: bool,
    served: HashSet<BluetoothAddress>,
}

pub struct AddressResolver {
    radios: Radios,
    settings: DiscoverySettings,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ResolutionEvent>,
    me: Weak<AddressResolver>,
}

impl AddressResolver {
    pub fn new(
        radios: Radios,
        settings: DiscoverySettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ResolutionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let resolver = Arc::new_cyclic(|me| Self {
            radios,
            settings,
            inner: Mutex::new(Inner::default()),
            events,
            me: me.clone(),
        });
        (resolver, rx)
    }

    pub fn provider_state(&self) -> ProviderState {
        self.inner.lock().provider.clone()
    }

    pub fn requester_state(&self) -> RequesterState {
        self.inner.lock().requester.clone()
    }

    pub fn is_providing(&self) -> bool {
        self.inner.lock().provider != ProviderState::Idle
    }

    pub fn is_receiving(&self) -> bool {
        self.inner.lock().requester != RequesterState::Idle
    }

    pub fn is_gatt_server_running(&self) -> bool {
        self.inner.lock().gatt_server_running
    }

    // -- Provider ---------------------------------------------------------

    /// Start helping the requester identified by `request_id`.
    ///
    /// Returns `false` without changing state when multi-advertisement is
    /// unsupported, a provide session is already active, or the request id
    /// is empty or malformed. Also returns `false` if a radio call fails, in
    /// which case the BLE scan has already been stopped.
    pub fn start_providing(&self, request_id: &str) -> bool {
        if request_id.is_empty() || !self.radios.ble.is_multi_advertisement_supported() {
            return false;
        }
        let Ok(request_uuid) = derive_request_uuid(self.settings.service_uuid, request_id) else {
            warn!(request_id, "refusing to provide for malformed request id");
            return false;
        };

        let mut inner = self.inner.lock();
        if inner.provider != ProviderState::Idle {
            return false;
        }

        // Classic inquiry and BLE scanning must not overlap.
        self.radios.ble.stop_scanning();

        let (found_tx, found_rx) = mpsc::unbounded_channel();
        if let Err(e) = self
            .radios
            .classic
            .start_device_discovery(DEVICE_DISCOVERY_TIMEOUT, found_tx)
        {
            warn!(request_id, error = %e, "failed to start device discovery");
            return false;
        }

        let sentinel = PeerAdvertisement {
            extra_information: 0,
            bluetooth_address: BluetoothAddress::UNKNOWN,
        };
        let data = advertisement::encode(sentinel, request_uuid, &self.settings);
        if let Err(e) = self
            .radios
            .ble
            .start_advertising(&data, &self.settings.advertise_settings())
        {
            warn!(request_id, error = %e, "failed to advertise provider payload");
            self.radios.classic.stop_device_discovery();
            return false;
        }

        inner.provide_session += 1;
        let session = inner.provide_session;
        inner.provider = ProviderState::Providing(request_id.to_string());
        inner.served.clear();
        inner.inquiry_task = Some(self.spawn_inquiry_pump(session, found_rx));

        let me = self.me.clone();
        inner
            .provide_timer
            .arm(self.settings.provide_address_timeout(), move |generation| {
                if let Some(resolver) = me.upgrade() {
                    resolver.on_provide_timeout(generation);
                }
            });

        info!(request_id, "providing Bluetooth address");
        true
    }

    /// End the provide session. A no-op when idle.
    pub fn stop_providing(&self) {
        let mut inner = self.inner.lock();
        self.stop_providing_locked(&mut inner);
    }

    fn stop_providing_locked(&self, inner: &mut Inner) {
        let ProviderState::Providing(request_id) = std::mem::take(&mut inner.provider) else {
            return;
        };
        inner.provide_session += 1;
        inner.provide_timer.cancel();
        if let Some(task) = inner.inquiry_task.take() {
            task.abort();
        }
        inner.served.clear();
        self.radios.classic.stop_device_discovery();
        self.radios.ble.stop_advertising();
        debug!(request_id = %request_id, "stopped providing");
        let _ = self.events.send(ResolutionEvent::ProvidingStopped { request_id });
    }

    fn spawn_inquiry_pump(
        &self,
        session: u64,
        mut found: mpsc::UnboundedReceiver<BluetoothAddress>,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(address) = found.recv().await {
                let Some(resolver) = me.upgrade() else { break };
                resolver.on_device_discovered(session, address);
            }
        })
    }

    fn on_device_discovered(&self, session: u64, address: BluetoothAddress) {
        {
            let mut inner = self.inner.lock();
            if inner.provide_session != session || inner.provider == ProviderState::Idle {
                return;
            }
            if !inner.served.insert(address) {
                return;
            }
        }

        let written = self.radios.ble.write_characteristic(
            address,
            self.settings.service_uuid,
            self.settings.address_characteristic_uuid,
            &address.octets(),
        );
        match written {
            Ok(()) => {
                info!(device = %address, "provided Bluetooth address");
                let mut inner = self.inner.lock();
                if inner.provide_session == session {
                    self.stop_providing_locked(&mut inner);
                }
            }
            // Most discovered devices are not waiting for an address.
            Err(e) => debug!(device = %address, error = %e, "address write not accepted"),
        }
    }

    fn on_provide_timeout(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if !inner.provide_timer.fire(generation) {
            return;
        }
        debug!("provide session timed out");
        self.stop_providing_locked(&mut inner);
    }

    // -- Requester --------------------------------------------------------

    /// Wait for a provider to write our address for `request_id`.
    ///
    /// Calling again with the same request id while waiting is a no-op.
    /// Returns `false` if a session for a different request is active or
    /// the GATT server cannot be started.
    pub fn start_receiving(&self, request_id: &str) -> bool {
        if request_id.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock();
        match &inner.requester {
            RequesterState::WaitingForAddress(active) if active == request_id => return true,
            RequesterState::WaitingForAddress(_) => return false,
            RequesterState::Idle => {}
        }

        if !inner.gatt_server_running {
            let (writes_tx, writes_rx) = mpsc::unbounded_channel();
            if let Err(e) = self.radios.ble.start_gatt_server(
                self.settings.service_uuid,
                self.settings.address_characteristic_uuid,
                writes_tx,
            ) {
                warn!(request_id, error = %e, "failed to start GATT server");
                return false;
            }
            inner.gatt_server_running = true;
            inner.gatt_task = Some(self.spawn_gatt_pump(writes_rx));
        }

        if self.settings.automate_address_resolution {
            if let Err(e) = self
                .radios
                .classic
                .make_discoverable(self.settings.discoverable_duration())
            {
                warn!(request_id, error = %e, "failed to become discoverable");
            }
        }

        inner.requester = RequesterState::WaitingForAddress(request_id.to_string());
        let me = self.me.clone();
        inner
            .receive_timer
            .arm(self.settings.provide_address_timeout(), move |generation| {
                if let Some(resolver) = me.upgrade() {
                    resolver.on_receive_timeout(generation);
                }
            });

        info!(request_id, "waiting for Bluetooth address");
        true
    }

    /// Abandon the requester session. A no-op when idle.
    pub fn stop_receiving(&self) {
        let mut inner = self.inner.lock();
        self.stop_receiving_locked(&mut inner);
    }

    fn stop_receiving_locked(&self, inner: &mut Inner) -> Option<String> {
        inner.receive_timer.cancel();
        self.stop_gatt_server_locked(inner);
        match std::mem::take(&mut inner.requester) {
            RequesterState::WaitingForAddress(request_id) => Some(request_id),
            RequesterState::Idle => None,
        }
    }

    fn stop_gatt_server_locked(&self, inner: &mut Inner) {
        if let Some(task) = inner.gatt_task.take() {
            task.abort();
        }
        if inner.gatt_server_running {
            inner.gatt_server_running = false;
            self.radios.ble.stop_gatt_server();
        }
    }

    fn spawn_gatt_pump(&self, mut writes: mpsc::UnboundedReceiver<GattWrite>) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(write) = writes.recv().await {
                let Some(resolver) = me.upgrade() else { break };
                resolver.on_gatt_write(&write);
            }
        })
    }

    fn on_gatt_write(&self, write: &GattWrite) {
        if write.characteristic != self.settings.address_characteristic_uuid {
            return;
        }
        let address = match BluetoothAddress::from_slice(&write.value) {
            Ok(address) if address.is_usable() => address,
            Ok(address) => {
                warn!(from = %write.device, %address, "rejecting unusable address write");
                return;
            }
            Err(e) => {
                warn!(from = %write.device, error = %e, "rejecting malformed address write");
                return;
            }
        };

        let mut inner = self.inner.lock();
        if inner.requester == RequesterState::Idle {
            return;
        }
        if let Some(request_id) = self.stop_receiving_locked(&mut inner) {
            info!(request_id = %request_id, %address, "Bluetooth address resolved");
            let _ = self
                .events
                .send(ResolutionEvent::AddressResolved { request_id, address });
        }
    }

    fn on_receive_timeout(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if !inner.receive_timer.fire(generation) {
            return;
        }
        if let Some(request_id) = self.stop_receiving_locked(&mut inner) {
            warn!(request_id = %request_id, "Bluetooth address resolution timed out");
            let _ = self
                .events
                .send(ResolutionEvent::ResolutionFailed { request_id });
        }
    }

    /// Reset both roles and the GATT server from any combination of states.
    pub fn stop_all_resolution_operations(&self) {
        let mut inner = self.inner.lock();
        self.stop_providing_locked(&mut inner);
        self.stop_receiving_locked(&mut inner);
        inner.gatt_server_running = false;
        self.radios.ble.stop_gatt_server();
    }
}

impl Drop for AddressResolver {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for task in [inner.inquiry_task.take(), inner.gatt_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use peerlink_radio::mock::{MockAir, MockCounters};

    use super::*;

    fn addr(n: u8) -> BluetoothAddress {
        BluetoothAddress::new([0x20, 0, 0, 0, 0, n])
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            provide_address_timeout_ms: 5_000,
            ..DiscoverySettings::default()
        }
    }

    #[tokio::test]
    async fn provider_fails_fast() {
        let air = MockAir::new();
        let radio = air.device(addr(1));
        let (resolver, _rx) = AddressResolver::new(radio.radios(), settings());

        assert!(!resolver.start_providing(""));
        assert!(resolver.start_providing("00000000abcd"));
        assert!(!resolver.start_providing("00000000abce"));
        resolver.stop_providing();

        radio.configure(|k| k.multi_advertisement_supported = false);
        assert!(!resolver.start_providing("00000000abcd"));
        assert_eq!(resolver.provider_state(), ProviderState::Idle);
    }

    #[tokio::test]
    async fn providing_stops_scan_before_inquiry() {
        let air = MockAir::new();
        let radio = air.device(addr(1));
        let (resolver, mut rx) = AddressResolver::new(radio.radios(), settings());

        assert!(resolver.start_providing("00000000abcd"));
        assert_eq!(MockCounters::get(&radio.counters.scan_stops), 1);
        assert!(radio.is_discovering_devices());
        assert!(radio.is_advertising());

        resolver.stop_providing();
        assert!(!radio.is_discovering_devices());
        assert_eq!(
            rx.recv().await,
            Some(ResolutionEvent::ProvidingStopped {
                request_id: "00000000abcd".to_string()
            })
        );

        // Idle stop touches nothing.
        let stops = radio.counters.device_discovery_stops.load(Ordering::SeqCst);
        resolver.stop_providing();
        assert_eq!(MockCounters::get(&radio.counters.device_discovery_stops), stops);
    }

    #[tokio::test]
    async fn valid_write_resolves_and_tears_down() {
        let air = MockAir::new();
        let radio = air.device(addr(1));
        let (resolver, mut rx) = AddressResolver::new(radio.radios(), settings());

        assert!(resolver.start_receiving("r1"));
        assert!(radio.is_gatt_server_running());
        assert!(radio.is_discoverable());

        assert!(radio.inject_gatt_write(addr(9), &addr(1).octets()));
        assert_eq!(
            rx.recv().await,
            Some(ResolutionEvent::AddressResolved {
                request_id: "r1".to_string(),
                address: addr(1),
            })
        );
        assert!(!radio.is_gatt_server_running());
        assert_eq!(resolver.requester_state(), RequesterState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_writes_are_ignored_until_deadline() {
        let air = MockAir::new();
        let radio = air.device(addr(1));
        let (resolver, mut rx) = AddressResolver::new(radio.radios(), settings());

        assert!(resolver.start_receiving("r1"));
        radio.inject_gatt_write(addr(9), &[1, 2, 3]);
        radio.inject_gatt_write(addr(9), &BluetoothAddress::UNKNOWN.octets());
        radio.inject_gatt_write(addr(9), &[0; 6]);

        assert_eq!(
            rx.recv().await,
            Some(ResolutionEvent::ResolutionFailed {
                request_id: "r1".to_string()
            })
        );
        assert!(!radio.is_gatt_server_running());
        assert_eq!(resolver.requester_state(), RequesterState::Idle);
    }

    #[tokio::test]
    async fn receiving_is_idempotent_per_request() {
        let air = MockAir::new();
        let radio = air.device(addr(1));
        let (resolver, _rx) = AddressResolver::new(radio.radios(), settings());

        assert!(resolver.start_receiving("r1"));
        assert!(resolver.start_receiving("r1"));
        assert!(!resolver.start_receiving("r2"));
        assert_eq!(MockCounters::get(&radio.counters.gatt_server_starts), 1);
    }

    #[tokio::test]
    async fn provider_writes_discovered_requester() {
        let air = MockAir::new();
        let provider = air.device(addr(1));
        let requester = air.device(addr(2));
        let (providing, mut provider_rx) = AddressResolver::new(provider.radios(), settings());
        let (receiving, mut requester_rx) = AddressResolver::new(requester.radios(), settings());

        assert!(receiving.start_receiving("00000000abcd"));
        assert!(providing.start_providing("00000000abcd"));

        assert_eq!(
            requester_rx.recv().await,
            Some(ResolutionEvent::AddressResolved {
                request_id: "00000000abcd".to_string(),
                address: addr(2),
            })
        );
        assert_eq!(
            provider_rx.recv().await,
            Some(ResolutionEvent::ProvidingStopped {
                request_id: "00000000abcd".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_from_any_state_allows_fresh_start() {
        let air = MockAir::new();
        let radio = air.device(addr(1));
        let (resolver, _rx) = AddressResolver::new(radio.radios(), settings());

        resolver.stop_all_resolution_operations();

        assert!(resolver.start_providing("00000000abcd"));
        assert!(resolver.start_receiving("r1"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        resolver.stop_all_resolution_operations();
        assert_eq!(resolver.provider_state(), ProviderState::Idle);
        assert_eq!(resolver.requester_state(), RequesterState::Idle);
        assert!(!radio.is_gatt_server_running());
        assert!(!radio.is_discovering_devices());

        assert!(resolver.start_providing("00000000abcd"));
        assert!(resolver.start_receiving("r1"));

        // Past the first sessions' deadlines, short of the new ones.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(resolver.is_providing());
        assert!(resolver.is_receiving());
    }
}
