//! Discovery settings, deserialised from the `[discovery]` config table.

use std::time::Duration;

use peerlink_radio::{AdvertiseMode, AdvertiseSettings, AdvertiseTxPower, ScanMode, ScanSettings};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Library default for the address-resolution deadline, substituted when the
/// configured value is zero.
pub const DEFAULT_PROVIDE_ADDRESS_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the requester stays discoverable when no timeout is configured.
pub const DEFAULT_DISCOVERABLE_DURATION: Duration = Duration::from_secs(300);

/// How long a provider's classic inquiry runs.
pub const DEVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Which radios discovery runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    #[default]
    Ble,
    Wifi,
    BleAndWifi,
}

impl DiscoveryMode {
    pub fn uses_ble(self) -> bool {
        matches!(self, Self::Ble | Self::BleAndWifi)
    }

    pub fn uses_wifi(self) -> bool {
        matches!(self, Self::Wifi | Self::BleAndWifi)
    }
}

/// Where the peer advertisement payload travels inside a BLE advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvertisementDataType {
    #[default]
    ServiceData,
    ManufacturerData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default)]
    pub mode: DiscoveryMode,
    /// Peers unseen for longer than this are expired; 0 disables expiry.
    #[serde(default = "default_peer_expiration_ms")]
    pub peer_expiration_ms: u64,
    #[serde(default)]
    pub advertise_mode: AdvertiseMode,
    #[serde(default)]
    pub advertise_tx_power: AdvertiseTxPower,
    #[serde(default)]
    pub scan_mode: ScanMode,
    #[serde(default)]
    pub scan_report_delay_ms: u64,
    #[serde(default)]
    pub advertisement_data_type: AdvertisementDataType,
    #[serde(default = "default_manufacturer_id")]
    pub manufacturer_id: u16,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    /// GATT characteristic the resolved address is written into.
    #[serde(default = "default_address_characteristic_uuid")]
    pub address_characteristic_uuid: Uuid,
    #[serde(default = "default_wifi_service_type")]
    pub wifi_service_type: String,
    #[serde(default = "default_provide_address_timeout_ms")]
    pub provide_address_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub automate_address_resolution: bool,
    #[serde(default = "default_start_retry_limit")]
    pub start_retry_limit: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::default(),
            peer_expiration_ms: default_peer_expiration_ms(),
            advertise_mode: AdvertiseMode::default(),
            advertise_tx_power: AdvertiseTxPower::default(),
            scan_mode: ScanMode::default(),
            scan_report_delay_ms: 0,
            advertisement_data_type: AdvertisementDataType::default(),
            manufacturer_id: default_manufacturer_id(),
            service_uuid: default_service_uuid(),
            address_characteristic_uuid: default_address_characteristic_uuid(),
            wifi_service_type: default_wifi_service_type(),
            provide_address_timeout_ms: default_provide_address_timeout_ms(),
            automate_address_resolution: true,
            start_retry_limit: default_start_retry_limit(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl DiscoverySettings {
    pub fn peer_expiration(&self) -> Duration {
        Duration::from_millis(self.peer_expiration_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// The resolution deadline; zero substitutes the library default.
    pub fn provide_address_timeout(&self) -> Duration {
        match self.provide_address_timeout_ms {
            0 => DEFAULT_PROVIDE_ADDRESS_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }

    /// How long the requester makes itself discoverable: the configured
    /// timeout in whole seconds, or the library default when unset.
    pub fn discoverable_duration(&self) -> Duration {
        match self.provide_address_timeout_ms {
            0 => DEFAULT_DISCOVERABLE_DURATION,
            ms => Duration::from_secs(ms / 1000),
        }
    }

    pub fn advertise_settings(&self) -> AdvertiseSettings {
        AdvertiseSettings {
            mode: self.advertise_mode,
            tx_power: self.advertise_tx_power,
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            mode: self.scan_mode,
            report_delay: Duration::from_millis(self.scan_report_delay_ms),
        }
    }
}

fn default_peer_expiration_ms() -> u64 {
    60_000
}

fn default_manufacturer_id() -> u16 {
    0xffff
}

fn default_service_uuid() -> Uuid {
    Uuid::from_u128(0x7d2e_4b3c_9f1a_4c8e_a6d5_2b1f_0e9c_8a71)
}

fn default_address_characteristic_uuid() -> Uuid {
    Uuid::from_u128(0x4e1c_77a0_3b52_4d19_9c6e_f03a_5d81_b2c4)
}

fn default_wifi_service_type() -> String {
    "_peerlink._tcp".to_string()
}

fn default_provide_address_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_start_retry_limit() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_substitutes_defaults() {
        let settings = DiscoverySettings {
            provide_address_timeout_ms: 0,
            ..DiscoverySettings::default()
        };
        assert_eq!(settings.provide_address_timeout(), DEFAULT_PROVIDE_ADDRESS_TIMEOUT);
        assert_eq!(settings.discoverable_duration(), DEFAULT_DISCOVERABLE_DURATION);
    }

    #[test]
    fn discoverable_duration_is_whole_seconds() {
        let settings = DiscoverySettings {
            provide_address_timeout_ms: 12_750,
            ..DiscoverySettings::default()
        };
        assert_eq!(settings.discoverable_duration(), Duration::from_secs(12));
    }

    #[test]
    fn parses_partial_table() {
        let settings: DiscoverySettings = toml::from_str(
            r#"
mode = "ble-and-wifi"
advertisement_data_type = "manufacturer-data"
scan_mode = "low-latency"
"#,
        )
        .unwrap();
        assert_eq!(settings.mode, DiscoveryMode::BleAndWifi);
        assert_eq!(settings.advertisement_data_type, AdvertisementDataType::ManufacturerData);
        assert_eq!(settings.scan_mode, ScanMode::LowLatency);
        assert_eq!(settings.peer_expiration_ms, 60_000);
    }
}
