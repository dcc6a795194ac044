//! Mapping between address-resolution request ids and BLE service UUIDs.
//!
//! A request UUID keeps the upper 64 bits of the service UUID and carries
//! the numeric request id in the lower 64 bits. Request ids are rendered as
//! lowercase hex, zero-padded to 12 digits.

use uuid::Uuid;

use crate::error::DiscoveryError;

const REQUEST_ID_MASK: u64 = 0xffff_ffff_ffff;

/// Render a numeric request id.
pub fn format_request_id(value: u64) -> String {
    format!("{value:012x}")
}

/// A fresh random 48-bit request id.
pub fn generate_request_id() -> String {
    let (_, low) = Uuid::new_v4().as_u64_pair();
    format_request_id(low & REQUEST_ID_MASK)
}

/// Parse a textual request id (1-16 hex digits) into its numeric value.
pub fn request_id_value(request_id: &str) -> Result<u64, DiscoveryError> {
    if request_id.is_empty() || request_id.len() > 16 {
        return Err(DiscoveryError::InvalidRequestId(request_id.to_string()));
    }
    u64::from_str_radix(request_id, 16)
        .map_err(|_| DiscoveryError::InvalidRequestId(request_id.to_string()))
}

pub fn derive_request_uuid(service: Uuid, request_id: &str) -> Result<Uuid, DiscoveryError> {
    let value = request_id_value(request_id)?;
    let (high, _) = service.as_u64_pair();
    Ok(Uuid::from_u64_pair(high, value))
}

pub fn parse_request_id(uuid: Uuid) -> String {
    let (_, low) = uuid.as_u64_pair();
    format_request_id(low)
}

/// Whether `uuid` is a request UUID derived from `service`.
pub fn is_request_uuid(service: Uuid, uuid: Uuid) -> bool {
    uuid != service && uuid.as_u64_pair().0 == service.as_u64_pair().0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Uuid {
        Uuid::from_u128(0x7d2e_4b3c_9f1a_4c8e_a6d5_2b1f_0e9c_8a71)
    }

    #[test]
    fn round_trip_over_48_bit_values() {
        let samples = [
            0,
            1,
            0xabc,
            0x1234_5678,
            0x0000_ffff_ffff,
            0x8000_0000_0000,
            REQUEST_ID_MASK,
        ];
        for n in samples {
            let uuid = derive_request_uuid(service(), &format_request_id(n)).unwrap();
            assert_eq!(parse_request_id(uuid), format!("{n:012x}"));
            assert!(is_request_uuid(service(), uuid));
        }
    }

    #[test]
    fn upper_bits_come_from_service() {
        let uuid = derive_request_uuid(service(), "00000000002a").unwrap();
        assert_eq!(uuid.as_u64_pair(), (service().as_u64_pair().0, 0x2a));
    }

    #[test]
    fn unpadded_ids_are_accepted() {
        let uuid = derive_request_uuid(service(), "2a").unwrap();
        assert_eq!(parse_request_id(uuid), "00000000002a");
    }

    #[test]
    fn invalid_ids_are_rejected() {
        for bad in ["", "xyz", "12345678901234567"] {
            assert!(derive_request_uuid(service(), bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn generated_ids_are_twelve_hex_digits() {
        let id = generate_request_id();
        assert_eq!(id.len(), 12);
        assert!(request_id_value(&id).unwrap() <= REQUEST_ID_MASK);
    }

    #[test]
    fn foreign_uuids_are_not_requests() {
        assert!(!is_request_uuid(service(), service()));
        assert!(!is_request_uuid(service(), Uuid::from_u128(1)));
    }
}
