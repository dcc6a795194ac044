//! BLE advertisement codec.
//!
//! A peer advertisement carries a one-byte extra-information value and the
//! six-byte Bluetooth address (or the unknown sentinel) under either the
//! service UUID or a request UUID derived from it.
//!
//! Service-data layout, keyed by the UUID:
//!   [extra][address: 6]
//!
//! Manufacturer-data layout, keyed by the manufacturer id:
//!   [0x02][0x15][uuid: 16, big-endian][extra][address: 6]

use peerlink_radio::AdvertisementData;
use peerlink_types::BluetoothAddress;
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::request_id::is_request_uuid;
use crate::settings::{AdvertisementDataType, DiscoverySettings};

pub const SERVICE_DATA_LEN: usize = 7;
pub const MANUFACTURER_DATA_LEN: usize = 25;
const BEACON_PREFIX: [u8; 2] = [0x02, 0x15];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAdvertisement {
    pub extra_information: u8,
    pub bluetooth_address: BluetoothAddress,
}

/// A decoded advertisement that belongs to this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAdvertisement {
    /// The service UUID or a request UUID derived from it.
    pub uuid: Uuid,
    /// `None` for a bare request advertisement.
    pub payload: Option<PeerAdvertisement>,
}

impl DecodedAdvertisement {
    pub fn is_request(&self, service: Uuid) -> bool {
        is_request_uuid(service, self.uuid)
    }
}

/// Build the advertisement for `payload` under `uuid`, using the configured
/// data type.
pub fn encode(
    payload: PeerAdvertisement,
    uuid: Uuid,
    settings: &DiscoverySettings,
) -> AdvertisementData {
    let mut data = AdvertisementData {
        service_uuids: vec![uuid],
        ..AdvertisementData::default()
    };
    match settings.advertisement_data_type {
        AdvertisementDataType::ServiceData => {
            data.service_data.insert(uuid, encode_service_data(payload));
        }
        AdvertisementDataType::ManufacturerData => {
            data.manufacturer_data
                .insert(settings.manufacturer_id, encode_manufacturer_data(payload, uuid));
        }
    }
    data
}

/// A bare advertisement of `uuid` with no peer payload.
pub fn encode_request(uuid: Uuid) -> AdvertisementData {
    AdvertisementData {
        service_uuids: vec![uuid],
        ..AdvertisementData::default()
    }
}

fn encode_service_data(payload: PeerAdvertisement) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SERVICE_DATA_LEN);
    bytes.push(payload.extra_information);
    bytes.extend_from_slice(&payload.bluetooth_address.octets());
    bytes
}

fn encode_manufacturer_data(payload: PeerAdvertisement, uuid: Uuid) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MANUFACTURER_DATA_LEN);
    bytes.extend_from_slice(&BEACON_PREFIX);
    bytes.extend_from_slice(uuid.as_bytes());
    bytes.extend_from_slice(&encode_service_data(payload));
    bytes
}

fn decode_service_data(bytes: &[u8]) -> Result<PeerAdvertisement, DiscoveryError> {
    if bytes.len() != SERVICE_DATA_LEN {
        return Err(DiscoveryError::Advertisement(format!(
            "service data is {} bytes, expected {SERVICE_DATA_LEN}",
            bytes.len()
        )));
    }
    let bluetooth_address = BluetoothAddress::from_slice(&bytes[1..])
        .map_err(|e| DiscoveryError::Advertisement(e.to_string()))?;
    Ok(PeerAdvertisement {
        extra_information: bytes[0],
        bluetooth_address,
    })
}

fn decode_manufacturer_data(bytes: &[u8]) -> Result<(Uuid, PeerAdvertisement), DiscoveryError> {
    if bytes.len() != MANUFACTURER_DATA_LEN || bytes[..2] != BEACON_PREFIX {
        return Err(DiscoveryError::Advertisement(format!(
            "manufacturer data is not a {MANUFACTURER_DATA_LEN}-byte beacon"
        )));
    }
    let uuid = Uuid::from_slice(&bytes[2..18])
        .map_err(|e| DiscoveryError::Advertisement(e.to_string()))?;
    Ok((uuid, decode_service_data(&bytes[18..])?))
}

/// Decode a received advertisement.
///
/// Returns `Ok(None)` for advertisements of other services. Both encodings
/// are accepted; the configured one is preferred when both are present.
pub fn decode(
    data: &AdvertisementData,
    settings: &DiscoverySettings,
) -> Result<Option<DecodedAdvertisement>, DiscoveryError> {
    let service = settings.service_uuid;
    let ours = |uuid: Uuid| uuid == service || is_request_uuid(service, uuid);

    let listed = data.uuids().copied().find(|u| ours(*u));

    let from_service_data = || -> Result<Option<DecodedAdvertisement>, DiscoveryError> {
        let Some(uuid) = listed else { return Ok(None) };
        match data.service_data.get(&uuid) {
            Some(bytes) => Ok(Some(DecodedAdvertisement {
                uuid,
                payload: Some(decode_service_data(bytes)?),
            })),
            None => Ok(None),
        }
    };

    let from_manufacturer_data = || -> Result<Option<DecodedAdvertisement>, DiscoveryError> {
        let Some(bytes) = data.manufacturer_data.get(&settings.manufacturer_id) else {
            return Ok(None);
        };
        let (uuid, payload) = decode_manufacturer_data(bytes)?;
        if !ours(uuid) {
            return Err(DiscoveryError::Advertisement(format!(
                "manufacturer data carries foreign UUID {uuid}"
            )));
        }
        Ok(Some(DecodedAdvertisement {
            uuid,
            payload: Some(payload),
        }))
    };

    let decoded = match settings.advertisement_data_type {
        AdvertisementDataType::ServiceData => match from_service_data()? {
            Some(decoded) => Some(decoded),
            None if listed.is_some() => None,
            None => from_manufacturer_data()?,
        },
        AdvertisementDataType::ManufacturerData => match from_manufacturer_data() {
            Ok(Some(decoded)) => Some(decoded),
            Ok(None) => from_service_data()?,
            Err(e) if listed.is_none() => return Err(e),
            Err(_) => from_service_data()?,
        },
    };

    Ok(decoded.or_else(|| {
        listed.map(|uuid| DecodedAdvertisement {
            uuid,
            payload: None,
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::derive_request_uuid;

    fn payload() -> PeerAdvertisement {
        PeerAdvertisement {
            extra_information: 3,
            bluetooth_address: BluetoothAddress::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
        }
    }

    fn manufacturer_settings() -> DiscoverySettings {
        DiscoverySettings {
            advertisement_data_type: AdvertisementDataType::ManufacturerData,
            ..DiscoverySettings::default()
        }
    }

    #[test]
    fn service_data_layout() {
        let settings = DiscoverySettings::default();
        let data = encode(payload(), settings.service_uuid, &settings);
        let bytes = &data.service_data[&settings.service_uuid];
        assert_eq!(bytes.as_slice(), &[3, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);

        let decoded = decode(&data, &settings).unwrap().unwrap();
        assert_eq!(decoded.uuid, settings.service_uuid);
        assert_eq!(decoded.payload, Some(payload()));
    }

    #[test]
    fn manufacturer_data_embeds_uuid() {
        let settings = manufacturer_settings();
        let data = encode(payload(), settings.service_uuid, &settings);
        let bytes = &data.manufacturer_data[&settings.manufacturer_id];
        assert_eq!(bytes.len(), MANUFACTURER_DATA_LEN);
        assert_eq!(&bytes[..2], &[0x02, 0x15]);
        assert_eq!(&bytes[2..18], settings.service_uuid.as_bytes());

        let decoded = decode(&data, &settings).unwrap().unwrap();
        assert_eq!(decoded.payload, Some(payload()));
    }

    #[test]
    fn decoder_accepts_either_encoding() {
        let manufacturer = manufacturer_settings();
        let data = encode(payload(), manufacturer.service_uuid, &manufacturer);
        let decoded = decode(&data, &DiscoverySettings::default()).unwrap().unwrap();
        assert_eq!(decoded.payload, Some(payload()));
    }

    #[test]
    fn request_advertisement_has_no_payload() {
        let settings = DiscoverySettings::default();
        let uuid = derive_request_uuid(settings.service_uuid, "00000000beef").unwrap();
        let decoded = decode(&encode_request(uuid), &settings).unwrap().unwrap();
        assert_eq!(decoded.uuid, uuid);
        assert!(decoded.payload.is_none());
        assert!(decoded.is_request(settings.service_uuid));
    }

    #[test]
    fn provider_advertisement_carries_sentinel() {
        let settings = DiscoverySettings::default();
        let uuid = derive_request_uuid(settings.service_uuid, "00000000beef").unwrap();
        let sentinel = PeerAdvertisement {
            extra_information: 0,
            bluetooth_address: BluetoothAddress::UNKNOWN,
        };
        let decoded = decode(&encode(sentinel, uuid, &settings), &settings)
            .unwrap()
            .unwrap();
        assert!(decoded.payload.unwrap().bluetooth_address.is_unknown());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let settings = DiscoverySettings::default();
        let mut data = encode(payload(), settings.service_uuid, &settings);
        data.service_data.insert(settings.service_uuid, vec![1, 2, 3]);
        assert!(decode(&data, &settings).is_err());
    }

    #[test]
    fn foreign_service_is_ignored() {
        let settings = DiscoverySettings::default();
        let data = encode_request(Uuid::from_u128(42));
        assert!(decode(&data, &settings).unwrap().is_none());
    }

    #[test]
    fn foreign_uuid_in_manufacturer_data_is_rejected() {
        let settings = manufacturer_settings();
        let mut data = encode(payload(), Uuid::from_u128(42), &settings);
        data.service_uuids.clear();
        assert!(decode(&data, &settings).is_err());
    }
}
