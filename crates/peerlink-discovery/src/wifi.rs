//! Wi-Fi Direct service records.
//!
//! The local peer announces itself with its identity JSON as the service
//! instance name. A service response is decoded back into a peer record
//! tagged with the Wi-Fi device address it came from.

use std::collections::HashMap;

use peerlink_types::{IdentityError, PeerIdentity, PeerProperties};

pub fn service_instance_name(identity: &PeerIdentity) -> Result<String, IdentityError> {
    identity.encode()
}

/// TXT record published alongside the service.
pub fn service_record() -> HashMap<String, String> {
    HashMap::new()
}

pub fn peer_from_service(
    instance_name: &str,
    device_address: &str,
) -> Result<PeerProperties, IdentityError> {
    let identity = PeerIdentity::decode(instance_name)?;
    Ok(identity
        .to_peer_properties()
        .with_wifi_device_address(device_address))
}

#[cfg(test)]
mod tests {
    use peerlink_types::BluetoothAddress;

    use super::*;

    #[test]
    fn service_round_trip_carries_wifi_address() {
        let address = BluetoothAddress::new([0x30, 1, 2, 3, 4, 5]);
        let identity = PeerIdentity::new("peer-7", "tablet", address);
        let name = service_instance_name(&identity).unwrap();

        let peer = peer_from_service(&name, "wifi-aa").unwrap();
        assert_eq!(peer.id, address.to_string());
        assert_eq!(peer.name.as_deref(), Some("tablet"));
        assert_eq!(peer.bluetooth_address, address);
        assert_eq!(peer.wifi_device_address.as_deref(), Some("wifi-aa"));
    }

    #[test]
    fn unresolved_peer_is_keyed_by_peer_id() {
        let identity = PeerIdentity::new("peer-7", "tablet", BluetoothAddress::UNKNOWN);
        let name = service_instance_name(&identity).unwrap();
        let peer = peer_from_service(&name, "wifi-aa").unwrap();
        assert_eq!(peer.id, "peer-7");
        assert!(peer.bluetooth_address.is_unknown());
    }

    #[test]
    fn foreign_instance_name_is_rejected() {
        assert!(peer_from_service("printer-1", "wifi-aa").is_err());
    }
}
