//! Transport-independent peer records.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::address::BluetoothAddress;

/// Everything known about one remote peer, merged across transports.
///
/// Two records describe the *same peer* iff their `id` matches. Equality and
/// hashing look at `id` only, because the other fields may still be unknown
/// when a peer is first sighted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerProperties {
    /// Stable identifier of the peer.
    pub id: String,
    /// Human-readable name, if announced.
    pub name: Option<String>,
    /// Classic Bluetooth address, [`BluetoothAddress::UNKNOWN`] until resolved.
    pub bluetooth_address: BluetoothAddress,
    /// Wi-Fi Direct device address, if sighted over Wi-Fi.
    pub wifi_device_address: Option<String>,
    /// Transport-specific hint carried in BLE advertisements.
    pub extra_information: Option<u8>,
}

impl PeerProperties {
    /// A record with only an id; every other field unknown.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            bluetooth_address: BluetoothAddress::UNKNOWN,
            wifi_device_address: None,
            extra_information: None,
        }
    }

    /// A peer sighted over Bluetooth, identified by its hardware address.
    #[must_use]
    pub fn from_bluetooth_address(address: BluetoothAddress) -> Self {
        Self {
            bluetooth_address: address,
            ..Self::new(address.to_string())
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_bluetooth_address(mut self, address: BluetoothAddress) -> Self {
        self.bluetooth_address = address;
        self
    }

    #[must_use]
    pub fn with_wifi_device_address(mut self, address: impl Into<String>) -> Self {
        self.wifi_device_address = Some(address.into());
        self
    }

    #[must_use]
    pub fn with_extra_information(mut self, extra: u8) -> Self {
        self.extra_information = Some(extra);
        self
    }

    /// Whether this (candidate) record fills at least one field that is
    /// unknown in `stored`.
    #[must_use]
    pub fn has_more_information(&self, stored: &PeerProperties) -> bool {
        (self.name.is_some() && stored.name.is_none())
            || (!self.bluetooth_address.is_unknown() && stored.bluetooth_address.is_unknown())
            || (self.wifi_device_address.is_some() && stored.wifi_device_address.is_none())
            || (self.extra_information.is_some() && stored.extra_information.is_none())
    }

    /// Whether this record knows strictly less than `stored`: it adds nothing,
    /// and `stored` knows something it does not.
    #[must_use]
    pub fn is_strict_subset_of(&self, stored: &PeerProperties) -> bool {
        !self.has_more_information(stored) && stored.has_more_information(self)
    }

    /// Fill the unknown fields of `self` from `other`. Known fields are never
    /// replaced, so merging is monotonic.
    ///
    /// Returns whether anything changed.
    pub fn merge_from(&mut self, other: &PeerProperties) -> bool {
        let mut changed = false;
        if self.name.is_none() && other.name.is_some() {
            self.name.clone_from(&other.name);
            changed = true;
        }
        if self.bluetooth_address.is_unknown() && !other.bluetooth_address.is_unknown() {
            self.bluetooth_address = other.bluetooth_address;
            changed = true;
        }
        if self.wifi_device_address.is_none() && other.wifi_device_address.is_some() {
            self.wifi_device_address.clone_from(&other.wifi_device_address);
            changed = true;
        }
        if self.extra_information.is_none() && other.extra_information.is_some() {
            self.extra_information = other.extra_information;
            changed = true;
        }
        changed
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl PartialEq for PeerProperties {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerProperties {}

impl Hash for PeerProperties {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for PeerProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.display_name(), self.bluetooth_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> BluetoothAddress {
        BluetoothAddress::new([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03])
    }

    #[test]
    fn equality_ignores_unknown_fields() {
        let a = PeerProperties::new("peer-1");
        let b = PeerProperties::new("peer-1")
            .with_name("phone")
            .with_bluetooth_address(addr());
        assert_eq!(a, b);
        assert_ne!(a, PeerProperties::new("peer-2"));
    }

    #[test]
    fn more_information_only_counts_gaps() {
        let stored = PeerProperties::new("p").with_name("phone");
        let same = PeerProperties::new("p").with_name("other name");
        assert!(!same.has_more_information(&stored));

        let filled = PeerProperties::new("p").with_bluetooth_address(addr());
        assert!(filled.has_more_information(&stored));
    }

    #[test]
    fn merge_never_discards_known_fields() {
        let mut stored = PeerProperties::new("p")
            .with_name("phone")
            .with_bluetooth_address(addr());
        let sparse = PeerProperties::new("p").with_extra_information(7);

        assert!(stored.merge_from(&sparse));
        assert_eq!(stored.name.as_deref(), Some("phone"));
        assert_eq!(stored.bluetooth_address, addr());
        assert_eq!(stored.extra_information, Some(7));

        assert!(!stored.merge_from(&PeerProperties::new("p")));
    }

    #[test]
    fn strict_subset() {
        let stored = PeerProperties::new("p").with_name("phone").with_extra_information(1);
        assert!(PeerProperties::new("p").is_strict_subset_of(&stored));
        assert!(!stored.clone().is_strict_subset_of(&stored));
        assert!(!PeerProperties::new("p")
            .with_bluetooth_address(addr())
            .is_strict_subset_of(&stored));
    }

    #[test]
    fn from_bluetooth_address_uses_address_as_id() {
        let peer = PeerProperties::from_bluetooth_address(addr());
        assert_eq!(peer.id, "AA:BB:CC:01:02:03");
        assert_eq!(peer.display_name(), "AA:BB:CC:01:02:03");
    }
}
