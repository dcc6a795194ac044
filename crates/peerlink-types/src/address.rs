//! Bluetooth hardware addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A six-byte Bluetooth MAC address.
///
/// Platforms that hide the local hardware address from applications report
/// [`BluetoothAddress::UNKNOWN`] instead: all zero bytes with the
/// locally-administered bit of the first octet set (`02:00:00:00:00:00`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BluetoothAddress([u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("expected 6 address bytes, got {0}")]
    Length(usize),

    #[error("malformed Bluetooth address: {0:?}")]
    Format(String),
}

impl BluetoothAddress {
    /// Sentinel for "this device does not know the address".
    pub const UNKNOWN: Self = Self([0x02, 0, 0, 0, 0, 0]);

    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build an address from a raw byte slice, e.g. a GATT characteristic value.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressParseError> {
        let bytes: [u8; 6] = bytes
            .try_into()
            .map_err(|_| AddressParseError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the unresolved-address sentinel.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    /// Whether this address can be used to reach a device.
    ///
    /// Rejects the sentinel and the all-zero address.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_unknown() && self.0 != [0; 6]
    }
}

impl Default for BluetoothAddress {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BluetoothAddress({self})")
    }
}

impl FromStr for BluetoothAddress {
    type Err = AddressParseError;

    /// Parse the colon-separated form `AA:BB:CC:DD:EE:FF` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressParseError::Format(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 {
                return Err(malformed());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self(bytes))
    }
}

impl Serialize for BluetoothAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BluetoothAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_uppercase_colon_separated() {
        let addr = BluetoothAddress::new([0xa1, 0xb2, 0x03, 0x44, 0x05, 0xff]);
        assert_eq!(addr.to_string(), "A1:B2:03:44:05:FF");
    }

    #[test]
    fn parse_accepts_lowercase() {
        let addr: BluetoothAddress = "a1:b2:03:44:05:ff".parse().unwrap();
        assert_eq!(addr.octets(), [0xa1, 0xb2, 0x03, 0x44, 0x05, 0xff]);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "A1:B2:03:44:05", "A1:B2:03:44:05:FF:00", "A1B2:03:44:05:FF", "ZZ:B2:03:44:05:FF"] {
            assert!(bad.parse::<BluetoothAddress>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn sentinel_is_unknown_and_unusable() {
        assert!(BluetoothAddress::UNKNOWN.is_unknown());
        assert!(!BluetoothAddress::UNKNOWN.is_usable());
        assert!(!BluetoothAddress::new([0; 6]).is_usable());
        assert_eq!(BluetoothAddress::UNKNOWN.to_string(), "02:00:00:00:00:00");
    }

    #[test]
    fn from_slice_checks_length() {
        assert_eq!(
            BluetoothAddress::from_slice(&[1, 2, 3]),
            Err(AddressParseError::Length(3))
        );
        assert!(BluetoothAddress::from_slice(&[1, 2, 3, 4, 5, 6]).is_ok());
    }

    #[test]
    fn serde_uses_string_form() {
        let addr = BluetoothAddress::new([1, 2, 3, 4, 5, 6]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: BluetoothAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
