//! Radio transport adapter contracts for peerlink.
//!
//! This crate defines the traits that platform radio backends implement:
//! [`BleAdapter`] (advertise, scan, GATT), [`ClassicBluetooth`] (device
//! discovery, discoverability), [`BluetoothSockets`] (RFCOMM-style
//! listen/connect) and [`WifiDirect`] (service discovery/advertisement).
//!
//! Control operations are synchronous and must not block; their results are
//! delivered through the unbounded channels handed to them. Socket
//! operations are asynchronous suspension points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_types::BluetoothAddress;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::RadioError;

/// The radios whose power state gates discovery and connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Radio {
    Bluetooth,
    Wifi,
}

impl std::fmt::Display for Radio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bluetooth => write!(f, "Bluetooth"),
            Self::Wifi => write!(f, "Wi-Fi"),
        }
    }
}

/// Advertising interval trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

/// Advertising transmission power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvertiseTxPower {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

/// Scan duty-cycle trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: AdvertiseTxPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSettings {
    pub mode: ScanMode,
    /// Batching delay for scan results; zero reports immediately.
    pub report_delay: Duration,
}

/// Payload of a BLE advertisement, as sent or as received.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisementData {
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl AdvertisementData {
    /// Every UUID the advertisement mentions, service list first.
    pub fn uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.service_uuids.iter().chain(self.service_data.keys())
    }
}

/// One BLE scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    /// Address the advertisement was sent from (often a private address).
    pub device_address: BluetoothAddress,
    pub data: AdvertisementData,
    pub rssi: Option<i16>,
}

/// Which advertisements a scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanFilter {
    /// Report advertisements mentioning a UUID whose upper 64 bits equal
    /// this UUID's upper 64 bits.
    pub service_uuid: Option<Uuid>,
    /// Report advertisements carrying manufacturer data with this id.
    pub manufacturer_id: Option<u16>,
}

impl ScanFilter {
    /// A record matches when it satisfies any configured criterion; an empty
    /// filter matches everything.
    pub fn matches(&self, data: &AdvertisementData) -> bool {
        if self.service_uuid.is_none() && self.manufacturer_id.is_none() {
            return true;
        }
        let by_uuid = self.service_uuid.is_some_and(|service| {
            let prefix = service.as_u64_pair().0;
            data.uuids().any(|u| u.as_u64_pair().0 == prefix)
        });
        let by_manufacturer = self
            .manufacturer_id
            .is_some_and(|id| data.manufacturer_data.contains_key(&id));
        by_uuid || by_manufacturer
    }
}

/// A value written into a local GATT characteristic by a remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWrite {
    pub device: BluetoothAddress,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Events from Wi-Fi Direct peer and service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    /// The set of visible Wi-Fi Direct device addresses changed.
    PeersChanged(Vec<String>),
    /// A service announcement was received.
    ServiceFound {
        instance_name: String,
        service_type: String,
        device_address: String,
    },
}

/// Bluetooth Low Energy advertiser, scanner and GATT endpoints.
pub trait BleAdapter: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    /// Whether the controller can advertise while doing other BLE work.
    fn is_multi_advertisement_supported(&self) -> bool;

    fn start_advertising(
        &self,
        data: &AdvertisementData,
        settings: &AdvertiseSettings,
    ) -> Result<(), RadioError>;

    fn stop_advertising(&self);

    fn start_scanning(
        &self,
        filter: &ScanFilter,
        settings: &ScanSettings,
        results: mpsc::UnboundedSender<ScanRecord>,
    ) -> Result<(), RadioError>;

    fn stop_scanning(&self);

    /// Open a GATT server exposing one writable characteristic.
    fn start_gatt_server(
        &self,
        service: Uuid,
        characteristic: Uuid,
        writes: mpsc::UnboundedSender<GattWrite>,
    ) -> Result<(), RadioError>;

    fn stop_gatt_server(&self);

    /// Connect to a remote GATT server and write one characteristic value.
    fn write_characteristic(
        &self,
        device: BluetoothAddress,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;
}

/// Classic (BR/EDR) Bluetooth inquiry and discoverability.
pub trait ClassicBluetooth: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    /// The local hardware address, or `None` where the platform hides it.
    fn local_address(&self) -> Option<BluetoothAddress>;

    fn start_device_discovery(
        &self,
        timeout: Duration,
        found: mpsc::UnboundedSender<BluetoothAddress>,
    ) -> Result<(), RadioError>;

    fn stop_device_discovery(&self);

    fn make_discoverable(&self, duration: Duration) -> Result<(), RadioError>;
}

/// A connected byte stream (RFCOMM socket or equivalent).
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// An open server socket accepting incoming connections.
#[async_trait]
pub trait SocketListener: Send + 'static {
    /// Wait for the next incoming connection and the remote address.
    async fn accept(&mut self) -> Result<(BoxedStream, BluetoothAddress), RadioError>;

    async fn close(&mut self);
}

/// Bluetooth stream sockets.
#[async_trait]
pub trait BluetoothSockets: Send + Sync + 'static {
    /// Listen on the given service record, or on a fixed channel when
    /// `port` is set.
    async fn listen(
        &self,
        service: Uuid,
        name: &str,
        port: Option<u8>,
    ) -> Result<Box<dyn SocketListener>, RadioError>;

    async fn connect(
        &self,
        address: BluetoothAddress,
        service: Uuid,
        port: Option<u8>,
    ) -> Result<BoxedStream, RadioError>;
}

/// Wi-Fi Direct peer/service discovery and service advertisement.
pub trait WifiDirect: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    fn discover_peers(&self, events: mpsc::UnboundedSender<WifiEvent>) -> Result<(), RadioError>;

    fn stop_discovery(&self);

    fn advertise_service(
        &self,
        instance_name: &str,
        service_type: &str,
        record: &HashMap<String, String>,
    ) -> Result<(), RadioError>;

    fn stop_advertising(&self);
}

/// The full set of radio backends a node runs on, injected at construction.
#[derive(Clone)]
pub struct Radios {
    pub ble: Arc<dyn BleAdapter>,
    pub classic: Arc<dyn ClassicBluetooth>,
    pub sockets: Arc<dyn BluetoothSockets>,
    pub wifi: Arc<dyn WifiDirect>,
}

impl Radios {
    pub fn is_enabled(&self, radio: Radio) -> bool {
        match radio {
            Radio::Bluetooth => self.classic.is_enabled() && self.ble.is_enabled(),
            Radio::Wifi => self.wifi.is_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(ScanFilter::default().matches(&AdvertisementData::default()));
    }

    #[test]
    fn uuid_filter_matches_on_upper_bits() {
        let service = Uuid::from_u64_pair(0x1234_5678_9abc_def0, 0x1111);
        let filter = ScanFilter {
            service_uuid: Some(service),
            manufacturer_id: None,
        };
        let derived = AdvertisementData {
            service_uuids: vec![Uuid::from_u64_pair(0x1234_5678_9abc_def0, 0xabcd)],
            ..AdvertisementData::default()
        };
        assert!(filter.matches(&derived));

        let foreign = AdvertisementData {
            service_uuids: vec![Uuid::from_u64_pair(1, 0x1111)],
            ..AdvertisementData::default()
        };
        assert!(!filter.matches(&foreign));
    }

    #[test]
    fn manufacturer_filter() {
        let filter = ScanFilter {
            service_uuid: None,
            manufacturer_id: Some(0xffff),
        };
        let mut data = AdvertisementData::default();
        assert!(!filter.matches(&data));
        data.manufacturer_data.insert(0xffff, vec![1]);
        assert!(filter.matches(&data));
    }
}
