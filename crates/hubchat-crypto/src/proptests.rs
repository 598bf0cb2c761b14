#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::{json, Map, Value};

    use crate::address::{device_address, is_valid_device_address};
    use crate::canonical::{canonicalize, hash_for_signing};
    use crate::chash::{chash_bytes, ChashLength};
    use crate::envelope::{open, seal};
    use crate::identity::{verify, DeviceKey, TempKey};

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            (-(1i64 << 53)..(1i64 << 53)).prop_map(|n| json!(n)),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 1..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    // Objects are not bracketed, so only flat values are guaranteed a
    // unique source string.
    fn flat() -> impl Strategy<Value = Value> {
        prop_oneof![
            leaf(),
            prop::collection::vec(leaf(), 1..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", leaf(), 1..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    }

    proptest! {
        // Key order never changes the canonical form
        #[test]
        fn test_canonical_ignores_key_order(
            entries in prop::collection::btree_map("[a-z]{1,6}", leaf(), 1..6)
        ) {
            let forward: Map<String, Value> = entries.clone().into_iter().collect();
            let reverse: Map<String, Value> = entries.into_iter().rev().collect();
            prop_assert_eq!(
                canonicalize(&Value::Object(forward)).unwrap(),
                canonicalize(&Value::Object(reverse)).unwrap()
            );
        }

        // Distinct flat values give distinct canonical forms
        #[test]
        fn test_canonical_injective(a in flat(), b in flat()) {
            prop_assume!(a != b);
            prop_assert_ne!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        }

        // Signing hash is blind to the signature field
        #[test]
        fn test_signing_hash_ignores_signature(body in tree(), sig in "[A-Za-z0-9+/]{8,88}") {
            let mut signed = json!({"body": body.clone()});
            let bare = signed.clone();
            signed["signature"] = Value::String(sig);
            prop_assert_eq!(hash_for_signing(&signed).unwrap(), hash_for_signing(&bare).unwrap());
        }

        #[test]
        fn test_chash_fixed_width(data in ".{0,64}") {
            prop_assert_eq!(chash_bytes(&data, ChashLength::Bits160).unwrap().len(), 20);
            prop_assert_eq!(chash_bytes(&data, ChashLength::Bits288).unwrap().len(), 36);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_device_address_shape(seed in any::<[u8; 32]>()) {
            prop_assume!(DeviceKey::from_bytes(&seed).is_ok());
            let key = DeviceKey::from_bytes(&seed).unwrap();
            let addr = device_address(key.pub_b64()).unwrap();
            prop_assert!(is_valid_device_address(&addr));
            prop_assert_eq!(addr, key.address().unwrap());
        }

        #[test]
        fn test_signature_round_trip(body in tree()) {
            let key = DeviceKey::generate();
            let msg = json!({"pubkey": key.pub_b64(), "body": body});
            let hash = hash_for_signing(&msg).unwrap();
            let sig = key.sign(&hash).unwrap();
            prop_assert!(verify(&hash, &sig, key.pub_b64()));

            let other = DeviceKey::generate();
            prop_assert!(!verify(&hash, &sig, other.pub_b64()));
        }

        #[test]
        fn test_envelope_round_trip(body in tree()) {
            let key = TempKey::new(DeviceKey::generate());
            let pkg = seal(&body, key.pub_b64()).unwrap();
            prop_assert_eq!(open(&pkg, &key).unwrap(), body);
        }
    }
}
