//! Device addresses.
//!
//! `address = "0" + chash160(source_string(pubkey_b64))`. The leading `0` is
//! the device-address version prefix; the rest is the 32-character base32
//! c-hash of the public key's canonical string form.

use serde_json::Value;

use crate::canonical::{source_string, CanonicalError};
use crate::chash::{chash160, ChashError};

pub const DEVICE_ADDRESS_PREFIX: char = '0';

/// Length of a device address: prefix plus 32 base32 characters.
pub const DEVICE_ADDRESS_LEN: usize = 33;

/// c-hash160 of the canonical source string of `value`.
///
/// Only fails on values canonicalization rejects; a plain string always
/// succeeds.
pub fn chash160_of(value: &Value) -> Result<String, AddressError> {
    let source = source_string(value)?;
    Ok(chash160(&source)?)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Chash(#[from] ChashError),
}

/// Derive the device address for a base64 public key.
pub fn device_address(pub_b64: &str) -> Result<String, AddressError> {
    let hash = chash160_of(&Value::String(pub_b64.to_owned()))?;
    Ok(format!("{DEVICE_ADDRESS_PREFIX}{hash}"))
}

/// Cheap structural check for a device address.
pub fn is_valid_device_address(address: &str) -> bool {
    address.len() == DEVICE_ADDRESS_LEN
        && address.starts_with(DEVICE_ADDRESS_PREFIX)
        && address[1..]
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PUB: &str = "ApI/CO2WC2e/3ALxNnGNW0anRJTrOCYzNBcY2EKq7n8o";

    #[test]
    fn test_golden_address() {
        assert_eq!(device_address(PUB).unwrap(), "0LULVVKM7U76SD5UDP6IBI7JMYJ2QNWNV");
    }

    #[test]
    fn test_address_matches_generic_chash() {
        let via_value = chash160_of(&json!(PUB)).unwrap();
        assert_eq!(device_address(PUB).unwrap(), format!("0{via_value}"));
    }

    #[test]
    fn test_address_shape() {
        for pk in [PUB, "AxuExVZ7EmRAmV0+1aq6BWXXHhg0YEgZ/5wX9enV3QeP"] {
            let a = device_address(pk).unwrap();
            assert_eq!(a, device_address(pk).unwrap());
            assert!(is_valid_device_address(&a), "{a}");
        }
        assert!(!is_valid_device_address("1LULVVKM7U76SD5UDP6IBI7JMYJ2QNWNV"));
        assert!(!is_valid_device_address("0lulvvkm7u76sd5udp6ibi7jmyj2qnwnv"));
        assert!(!is_valid_device_address("0LULVV"));
    }

    #[test]
    fn test_chash160_of_rejects_null() {
        assert!(matches!(
            chash160_of(&json!({"a": null})),
            Err(AddressError::Canonical(_))
        ));
    }
}
