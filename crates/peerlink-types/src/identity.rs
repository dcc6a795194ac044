//! Identity record exchanged during the connection handshake and carried in
//! Wi-Fi Direct service announcements.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::BluetoothAddress;
use crate::peer::PeerProperties;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed identity record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("identity record has an empty peer id")]
    EmptyPeerId,
}

/// `{"peerId": …, "peerName": …, "bluetoothAddress": …}`.
///
/// All three members are required; a record missing any of them does not
/// decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub peer_id: String,
    pub peer_name: String,
    pub bluetooth_address: String,
}

impl PeerIdentity {
    #[must_use]
    pub fn new(
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        bluetooth_address: BluetoothAddress,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            bluetooth_address: bluetooth_address.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, IdentityError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, IdentityError> {
        let identity: Self = serde_json::from_str(text)?;
        if identity.peer_id.is_empty() {
            return Err(IdentityError::EmptyPeerId);
        }
        Ok(identity)
    }

    /// The announced Bluetooth address; unparseable text reads as unknown.
    #[must_use]
    pub fn bluetooth_address(&self) -> BluetoothAddress {
        self.bluetooth_address.parse().unwrap_or(BluetoothAddress::UNKNOWN)
    }

    /// Convert into a peer record. An empty name is treated as unknown.
    ///
    /// A usable Bluetooth address becomes the record's id, as it is for BLE
    /// sightings, so one device maps to one peer whichever transport
    /// announced it. Only peers without one are keyed by `peer_id`.
    #[must_use]
    pub fn to_peer_properties(&self) -> PeerProperties {
        let address = self.bluetooth_address();
        let mut peer = if address.is_usable() {
            PeerProperties::from_bluetooth_address(address)
        } else {
            PeerProperties::new(self.peer_id.clone()).with_bluetooth_address(address)
        };
        if !self.peer_name.is_empty() {
            peer.name = Some(self.peer_name.clone());
        }
        peer
    }
}
