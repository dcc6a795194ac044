//! The discovery state machine.
//!
//! [`DiscoveryManager`] owns the requested discovery mode and starts or
//! stops the BLE and Wi-Fi Direct transports to match it and the current
//! radio power state. Sightings from either transport are merged into the
//! shared [`PeerModel`]; request advertisements drive the address
//! resolver.
//!
//! All state changes happen under one lock. Listener notifications are
//! collected while the lock is held and delivered after it is released, so
//! a listener may call back into the manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use peerlink_radio::{AdvertisementData, Radio, Radios, ScanFilter, ScanRecord, WifiEvent};
use peerlink_types::{
    BluetoothAddress, Listener, ListenerRegistry, PeerIdentity, PeerProperties,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::advertisement::{self, DecodedAdvertisement, PeerAdvertisement};
use crate::error::DiscoveryError;
use crate::peer_model::{PeerModel, PeerModelEvent};
use crate::request_id::{derive_request_uuid, generate_request_id, parse_request_id};
use crate::resolution::{AddressResolver, ResolutionEvent};
use crate::settings::{AdvertisementDataType, DiscoveryMode, DiscoverySettings};
use crate::state::{DiscoveryState, Transport};
use crate::timer::Timer;
use crate::wifi;

/// How the local peer presents itself to others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub id: String,
    pub name: String,
    pub extra_information: u8,
}

impl LocalPeer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            extra_information: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    StateChanged(DiscoveryState),
    PeerDiscovered(PeerProperties),
    PeerUpdated(PeerProperties),
    PeerLost(PeerProperties),
    PeerExpired(PeerProperties),
    /// A nearby peer asked to be told its Bluetooth address.
    ProvideAddressRequested {
        request_id: String,
    },
    /// The local Bluetooth address was learned from a neighbour.
    BluetoothAddressResolved(BluetoothAddress),
    BluetoothAddressResolutionFailed {
        request_id: String,
    },
    /// A transport failed to start too many times in a row and stays down
    /// until the next radio event or `start`.
    TransportFailed {
        transport: Transport,
        error: String,
    },
}

#[derive(Default)]
struct Inner {
    state: DiscoveryState,
    requested: Option<DiscoveryMode>,
    ble_running: bool,
    wifi_running: bool,
    /// The BLE scan is paused while this device provides an address.
    scan_suspended: bool,
    /// Request id of the provide session the scan is paused for.
    providing_request: Option<String>,
    scan_task: Option<JoinHandle<()>>,
    wifi_task: Option<JoinHandle<()>>,
    local_address: Option<BluetoothAddress>,
    /// Our outstanding address request while the local address is hidden.
    pending_request: Option<String>,
    /// Request ids already answered (or refused) as a provider.
    handled_requests: HashSet<String>,
    restart_timer: Timer,
    start_failures: HashMap<Transport, u32>,
    given_up: HashSet<Transport>,
}

pub struct DiscoveryManager {
    radios: Radios,
    settings: DiscoverySettings,
    local: LocalPeer,
    peer_model: Arc<PeerModel>,
    resolver: Arc<AddressResolver>,
    resolution_task: JoinHandle<()>,
    model_listener: Listener<PeerModelEvent>,
    inner: Mutex<Inner>,
    listeners: ListenerRegistry<DiscoveryEvent>,
    me: Weak<DiscoveryManager>,
}

impl DiscoveryManager {
    /// Create a stopped manager. Must be called within a Tokio runtime.
    pub fn new(
        radios: Radios,
        settings: DiscoverySettings,
        local: LocalPeer,
        peer_model: Arc<PeerModel>,
    ) -> Result<Arc<Self>, DiscoveryError> {
        let (resolver, mut resolution_rx) = AddressResolver::new(radios.clone(), settings.clone());
        let local_address = radios.classic.local_address().filter(BluetoothAddress::is_usable);

        let manager = Arc::new_cyclic(|me: &Weak<Self>| {
            let resolution_task = {
                let me = me.clone();
                tokio::spawn(async move {
                    while let Some(event) = resolution_rx.recv().await {
                        let Some(manager) = me.upgrade() else { break };
                        manager.on_resolution_event(event);
                    }
                })
            };
            let model_listener: Listener<PeerModelEvent> = {
                let me = me.clone();
                Arc::new(move |event: &PeerModelEvent| {
                    if let Some(manager) = me.upgrade() {
                        manager.on_peer_model_event(event);
                    }
                })
            };
            Self {
                radios,
                settings,
                local,
                peer_model,
                resolver,
                resolution_task,
                model_listener,
                inner: Mutex::new(Inner {
                    local_address,
                    ..Inner::default()
                }),
                listeners: ListenerRegistry::new(),
                me: me.clone(),
            }
        });
        manager.peer_model.add_listener(&manager.model_listener)?;
        Ok(manager)
    }

    pub fn state(&self) -> DiscoveryState {
        self.inner.lock().state
    }

    pub fn requested_mode(&self) -> Option<DiscoveryMode> {
        self.inner.lock().requested
    }

    /// The local Bluetooth address, once known or resolved.
    pub fn local_bluetooth_address(&self) -> Option<BluetoothAddress> {
        self.inner.lock().local_address
    }

    pub fn pending_request_id(&self) -> Option<String> {
        self.inner.lock().pending_request.clone()
    }

    pub fn peer_model(&self) -> &Arc<PeerModel> {
        &self.peer_model
    }

    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.resolver
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    pub fn add_listener(&self, listener: &Listener<DiscoveryEvent>) -> Result<(), DiscoveryError> {
        Ok(self.listeners.add(listener)?)
    }

    pub fn remove_listener(&self, listener: &Listener<DiscoveryEvent>) -> bool {
        self.listeners.remove(listener)
    }

    /// Start discovery in `mode`.
    ///
    /// Transports whose radio is off are skipped; if none can run the state
    /// becomes `WaitingForRadiosEnabled`. Calling again with the running mode
    /// is rejected with [`DiscoveryError::AlreadyRunning`]; a different mode
    /// stops and starts transports as needed.
    pub fn start(&self, mode: DiscoveryMode) -> Result<DiscoveryState, DiscoveryError> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if inner.requested == Some(mode) && inner.state != DiscoveryState::NotStarted {
                return Err(DiscoveryError::AlreadyRunning);
            }
            info!(?mode, "starting discovery");
            inner.requested = Some(mode);
            inner.start_failures.clear();
            inner.given_up.clear();
            let failures = self.reconcile(&mut inner, &mut events);
            if inner.state == DiscoveryState::NotStarted && !failures.is_empty() {
                Err(DiscoveryError::StartFailed(failures.join("; ")))
            } else {
                Ok(inner.state)
            }
        };
        self.notify_all(events);
        result
    }

    /// Stop every transport and resolution session.
    pub fn stop(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.requested.is_none() && inner.state == DiscoveryState::NotStarted {
                return;
            }
            info!("stopping discovery");
            inner.requested = None;
            inner.restart_timer.cancel();
            if inner.ble_running {
                self.stop_ble(&mut inner);
            }
            if inner.wifi_running {
                self.stop_wifi(&mut inner);
            }
            self.resolver.stop_all_resolution_operations();
            inner.scan_suspended = false;
            inner.providing_request = None;
            inner.pending_request = None;
            inner.handled_requests.clear();
            inner.start_failures.clear();
            inner.given_up.clear();
            self.set_state(&mut inner, DiscoveryState::NotStarted, &mut events);
        }
        self.notify_all(events);
    }

    /// React to a radio being switched on or off.
    pub fn on_radio_state_changed(&self, radio: Radio, enabled: bool) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.requested.is_none() {
                return;
            }
            info!(%radio, enabled, "radio state changed");
            for transport in [Transport::Ble, Transport::Wifi] {
                if transport.radio() == radio {
                    inner.given_up.remove(&transport);
                    inner.start_failures.remove(&transport);
                }
            }
            self.reconcile(&mut inner, &mut events);
        }
        self.notify_all(events);
    }

    /// Provide an address for `request_id` on request of the application,
    /// for use when resolution is not automated.
    pub fn start_providing(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock();
        self.begin_providing(&mut inner, request_id)
    }

    // -- Reconciliation ---------------------------------------------------

    /// Bring the running transports in line with the requested mode and the
    /// radio power state. Returns the start failures.
    fn reconcile(&self, inner: &mut Inner, events: &mut Vec<DiscoveryEvent>) -> Vec<String> {
        let mut failures = Vec::new();
        let Some(mode) = inner.requested else {
            self.set_state(inner, DiscoveryState::NotStarted, events);
            return failures;
        };
        let want_ble = mode.uses_ble() && self.radios.is_enabled(Radio::Bluetooth);
        let want_wifi = mode.uses_wifi() && self.radios.is_enabled(Radio::Wifi);

        if inner.ble_running && !want_ble {
            self.stop_ble(inner);
        }
        if inner.wifi_running && !want_wifi {
            self.stop_wifi(inner);
        }

        let mut retry = false;
        for (transport, wanted, running) in [
            (Transport::Ble, want_ble, inner.ble_running),
            (Transport::Wifi, want_wifi, inner.wifi_running),
        ] {
            if !wanted || running || inner.given_up.contains(&transport) {
                continue;
            }
            let started = match transport {
                Transport::Ble => self.start_ble(inner),
                Transport::Wifi => self.start_wifi(inner),
            };
            match started {
                Ok(()) => {
                    debug!(%transport, "transport started");
                    inner.start_failures.remove(&transport);
                }
                Err(e) => {
                    failures.push(format!("{transport}: {e}"));
                    let count = inner.start_failures.entry(transport).or_insert(0);
                    *count += 1;
                    let count = *count;
                    warn!(%transport, attempt = count, error = %e, "transport failed to start");
                    if count >= self.settings.start_retry_limit.max(1) {
                        inner.given_up.insert(transport);
                        events.push(DiscoveryEvent::TransportFailed {
                            transport,
                            error: e.to_string(),
                        });
                    } else {
                        retry = true;
                    }
                }
            }
        }

        if retry && !inner.restart_timer.is_armed() {
            let me = self.me.clone();
            inner
                .restart_timer
                .arm(self.settings.restart_delay(), move |generation| {
                    if let Some(manager) = me.upgrade() {
                        manager.on_restart_timer(generation);
                    }
                });
        }

        let state = match DiscoveryState::running(inner.ble_running, inner.wifi_running) {
            Some(state) => state,
            None if want_ble || want_wifi => DiscoveryState::NotStarted,
            None => DiscoveryState::WaitingForRadiosEnabled,
        };
        self.set_state(inner, state, events);
        failures
    }

    fn set_state(&self, inner: &mut Inner, state: DiscoveryState, events: &mut Vec<DiscoveryEvent>) {
        if inner.state != state {
            info!(from = ?inner.state, to = ?state, "discovery state changed");
            inner.state = state;
            events.push(DiscoveryEvent::StateChanged(state));
        }
    }

    fn on_restart_timer(&self, generation: u64) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.restart_timer.fire(generation) || inner.requested.is_none() {
                return;
            }
            debug!("retrying transport start");
            self.reconcile(&mut inner, &mut events);
        }
        self.notify_all(events);
    }

    // -- BLE --------------------------------------------------------------

    fn start_ble(&self, inner: &mut Inner) -> Result<(), DiscoveryError> {
        if inner.local_address.is_none() {
            inner.local_address = self
                .radios
                .classic
                .local_address()
                .filter(BluetoothAddress::is_usable);
        }

        let advertising = self.radios.ble.is_multi_advertisement_supported();
        if advertising {
            let data = self.own_advertisement(inner)?;
            self.radios
                .ble
                .start_advertising(&data, &self.settings.advertise_settings())?;
        } else {
            info!("multi-advertisement unsupported, scanning only");
        }

        if !inner.scan_suspended {
            if let Err(e) = self.start_scan(inner) {
                if advertising {
                    self.radios.ble.stop_advertising();
                }
                return Err(e);
            }
        }
        inner.ble_running = true;
        Ok(())
    }

    fn stop_ble(&self, inner: &mut Inner) {
        self.radios.ble.stop_advertising();
        self.stop_scan(inner);
        self.resolver.stop_all_resolution_operations();
        inner.scan_suspended = false;
        inner.providing_request = None;
        inner.pending_request = None;
        inner.ble_running = false;
    }

    /// Our peer advertisement, or a request advertisement while the local
    /// address is unknown.
    fn own_advertisement(&self, inner: &mut Inner) -> Result<AdvertisementData, DiscoveryError> {
        if let Some(address) = inner.local_address {
            let payload = PeerAdvertisement {
                extra_information: self.local.extra_information,
                bluetooth_address: address,
            };
            return Ok(advertisement::encode(
                payload,
                self.settings.service_uuid,
                &self.settings,
            ));
        }
        let request_id = inner
            .pending_request
            .get_or_insert_with(generate_request_id)
            .clone();
        debug!(request_id = %request_id, "advertising address request");
        let uuid = derive_request_uuid(self.settings.service_uuid, &request_id)?;
        Ok(advertisement::encode_request(uuid))
    }

    fn readvertise(&self, inner: &mut Inner) {
        if !inner.ble_running || !self.radios.ble.is_multi_advertisement_supported() {
            return;
        }
        self.radios.ble.stop_advertising();
        let started = self.own_advertisement(inner).and_then(|data| {
            self.radios
                .ble
                .start_advertising(&data, &self.settings.advertise_settings())
                .map_err(DiscoveryError::from)
        });
        if let Err(e) = started {
            warn!(error = %e, "failed to restart advertisement");
        }
    }

    fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            service_uuid: Some(self.settings.service_uuid),
            manufacturer_id: (self.settings.advertisement_data_type
                == AdvertisementDataType::ManufacturerData)
                .then_some(self.settings.manufacturer_id),
        }
    }

    fn start_scan(&self, inner: &mut Inner) -> Result<(), DiscoveryError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ScanRecord>();
        self.radios
            .ble
            .start_scanning(&self.scan_filter(), &self.settings.scan_settings(), tx)?;
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let Some(manager) = me.upgrade() else { break };
                manager.on_scan_record(&record);
            }
        });
        if let Some(previous) = inner.scan_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self, inner: &mut Inner) {
        self.radios.ble.stop_scanning();
        if let Some(task) = inner.scan_task.take() {
            task.abort();
        }
    }

    fn on_scan_record(&self, record: &ScanRecord) {
        let decoded = match advertisement::decode(&record.data, &self.settings) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return,
            Err(e) => {
                debug!(device = %record.device_address, error = %e, "ignoring advertisement");
                return;
            }
        };
        trace!(device = %record.device_address, uuid = %decoded.uuid, "advertisement");

        let mut events = Vec::new();
        let sighting = {
            let mut inner = self.inner.lock();
            if !inner.ble_running {
                return;
            }
            if decoded.is_request(self.settings.service_uuid) {
                self.on_request_advertisement(&mut inner, &decoded, &mut events);
                None
            } else {
                decoded
                    .payload
                    .filter(|p| Some(p.bluetooth_address) != inner.local_address)
                    .map(|p| peer_from_advertisement(record.device_address, p))
            }
        };
        self.notify_all(events);
        if let Some(peer) = sighting {
            self.peer_model.add_or_update(peer);
        }
    }

    fn on_request_advertisement(
        &self,
        inner: &mut Inner,
        decoded: &DecodedAdvertisement,
        events: &mut Vec<DiscoveryEvent>,
    ) {
        let request_id = parse_request_id(decoded.uuid);
        let ours = inner.pending_request.as_deref() == Some(request_id.as_str());
        match decoded.payload {
            None if !ours => {
                if inner.handled_requests.contains(&request_id) || self.resolver.is_providing() {
                    return;
                }
                debug!(request_id = %request_id, "peer requests its Bluetooth address");
                events.push(DiscoveryEvent::ProvideAddressRequested {
                    request_id: request_id.clone(),
                });
                if self.settings.automate_address_resolution {
                    self.begin_providing(inner, &request_id);
                }
            }
            Some(payload) if ours && payload.bluetooth_address.is_unknown() => {
                // A provider is answering our request.
                if !self.resolver.start_receiving(&request_id) {
                    warn!(request_id = %request_id, "could not wait for Bluetooth address");
                }
            }
            _ => {}
        }
    }

    fn begin_providing(&self, inner: &mut Inner, request_id: &str) -> bool {
        if !self.radios.ble.is_multi_advertisement_supported()
            || self.resolver.is_providing()
            || !inner.handled_requests.insert(request_id.to_string())
        {
            return false;
        }
        // The resolver stops the BLE scan before its inquiry.
        inner.scan_suspended = true;
        if let Some(task) = inner.scan_task.take() {
            task.abort();
        }
        if self.resolver.start_providing(request_id) {
            inner.providing_request = Some(request_id.to_string());
            return true;
        }
        inner.scan_suspended = false;
        inner.providing_request = None;
        if inner.ble_running {
            if let Err(e) = self.start_scan(inner) {
                warn!(error = %e, "failed to resume scan");
            }
        }
        false
    }

    // -- Wi-Fi Direct -----------------------------------------------------

    fn start_wifi(&self, inner: &mut Inner) -> Result<(), DiscoveryError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WifiEvent>();
        self.radios.wifi.discover_peers(tx)?;
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = me.upgrade() else { break };
                manager.on_wifi_event(event);
            }
        });
        if let Some(previous) = inner.wifi_task.replace(task) {
            previous.abort();
        }

        if let Err(e) = self.advertise_wifi_service(inner) {
            self.radios.wifi.stop_discovery();
            if let Some(task) = inner.wifi_task.take() {
                task.abort();
            }
            return Err(e);
        }
        inner.wifi_running = true;
        Ok(())
    }

    fn stop_wifi(&self, inner: &mut Inner) {
        self.radios.wifi.stop_discovery();
        self.radios.wifi.stop_advertising();
        if let Some(task) = inner.wifi_task.take() {
            task.abort();
        }
        inner.wifi_running = false;
    }

    fn advertise_wifi_service(&self, inner: &Inner) -> Result<(), DiscoveryError> {
        let identity = PeerIdentity::new(
            self.local.id.clone(),
            self.local.name.clone(),
            inner.local_address.unwrap_or(BluetoothAddress::UNKNOWN),
        );
        let instance_name = wifi::service_instance_name(&identity)?;
        self.radios.wifi.advertise_service(
            &instance_name,
            &self.settings.wifi_service_type,
            &wifi::service_record(),
        )?;
        Ok(())
    }

    fn on_wifi_event(&self, event: WifiEvent) {
        if !self.inner.lock().wifi_running {
            return;
        }
        match event {
            WifiEvent::ServiceFound {
                instance_name,
                service_type,
                device_address,
            } => {
                if service_type != self.settings.wifi_service_type {
                    return;
                }
                let local_address = self.inner.lock().local_address;
                match wifi::peer_from_service(&instance_name, &device_address) {
                    Ok(peer)
                        if peer.id != self.local.id
                            && Some(peer.bluetooth_address) != local_address =>
                    {
                        // Re-keyed once the peer's address became known.
                        let stale = self
                            .peer_model
                            .find_by_wifi_device_address(&device_address)
                            .filter(|stale| stale.id != peer.id);
                        if let Some(removed) = stale.and_then(|s| self.peer_model.remove(&s.id)) {
                            debug!(old = %removed.id, new = %peer.id, "Wi-Fi peer re-keyed");
                            self.listeners.notify(&DiscoveryEvent::PeerLost(removed));
                        }
                        self.peer_model.add_or_update(peer);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(device = %device_address, error = %e, "ignoring service"),
                }
            }
            WifiEvent::PeersChanged(visible) => {
                let lost: Vec<PeerProperties> = self
                    .peer_model
                    .peers()
                    .into_iter()
                    .filter(|peer| {
                        peer.bluetooth_address.is_unknown()
                            && peer
                                .wifi_device_address
                                .as_ref()
                                .is_some_and(|address| !visible.contains(address))
                    })
                    .collect();
                for peer in lost {
                    if let Some(removed) = self.peer_model.remove(&peer.id) {
                        debug!(peer = %removed.id, "Wi-Fi peer lost");
                        self.listeners.notify(&DiscoveryEvent::PeerLost(removed));
                    }
                }
            }
        }
    }

    // -- Resolution -------------------------------------------------------

    fn on_resolution_event(&self, event: ResolutionEvent) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            match event {
                ResolutionEvent::AddressResolved {
                    request_id,
                    address,
                } => {
                    if inner.pending_request.as_deref() != Some(request_id.as_str()) {
                        return;
                    }
                    info!(%address, "local Bluetooth address resolved");
                    inner.pending_request = None;
                    inner.local_address = Some(address);
                    self.readvertise(&mut inner);
                    if inner.wifi_running {
                        self.radios.wifi.stop_advertising();
                        if let Err(e) = self.advertise_wifi_service(&inner) {
                            warn!(error = %e, "failed to refresh Wi-Fi service");
                        }
                    }
                    events.push(DiscoveryEvent::BluetoothAddressResolved(address));
                }
                ResolutionEvent::ResolutionFailed { request_id } => {
                    if inner.pending_request.as_deref() != Some(request_id.as_str()) {
                        return;
                    }
                    inner.pending_request = Some(generate_request_id());
                    self.readvertise(&mut inner);
                    events.push(DiscoveryEvent::BluetoothAddressResolutionFailed { request_id });
                }
                ResolutionEvent::ProvidingStopped { request_id } => {
                    // A stop queued behind a newer session must not resume
                    // scanning during that session's inquiry.
                    if inner.providing_request.as_deref() != Some(request_id.as_str())
                        || self.resolver.is_providing()
                    {
                        debug!(request_id = %request_id, "ignoring stale provide stop");
                        return;
                    }
                    inner.providing_request = None;
                    if !std::mem::take(&mut inner.scan_suspended) || !inner.ble_running {
                        return;
                    }
                    debug!(request_id = %request_id, "resuming BLE scan");
                    self.readvertise(&mut inner);
                    if let Err(e) = self.start_scan(&mut inner) {
                        warn!(error = %e, "failed to resume scan");
                    }
                }
            }
        }
        self.notify_all(events);
    }

    fn on_peer_model_event(&self, event: &PeerModelEvent) {
        let event = match event {
            PeerModelEvent::Added(peer) => DiscoveryEvent::PeerDiscovered(peer.clone()),
            PeerModelEvent::Updated(peer) => DiscoveryEvent::PeerUpdated(peer.clone()),
            PeerModelEvent::Expired(peer) => DiscoveryEvent::PeerExpired(peer.clone()),
        };
        self.listeners.notify(&event);
    }

    fn notify_all(&self, events: Vec<DiscoveryEvent>) {
        for event in events {
            self.listeners.notify(&event);
        }
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        self.peer_model.remove_listener(&self.model_listener);
        self.resolution_task.abort();
        let inner = self.inner.get_mut();
        for task in [inner.scan_task.take(), inner.wifi_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// A peer record for a BLE sighting. Peers that advertise an unresolved
/// address are keyed by the address the advertisement came from.
fn peer_from_advertisement(device: BluetoothAddress, payload: PeerAdvertisement) -> PeerProperties {
    let peer = if payload.bluetooth_address.is_usable() {
        PeerProperties::from_bluetooth_address(payload.bluetooth_address)
    } else {
        PeerProperties::new(device.to_string())
    };
    peer.with_extra_information(payload.extra_information)
}
