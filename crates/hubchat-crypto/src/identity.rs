//! Device identity keys on secp256k1.
//!
//! A device has one permanent key (imported from WIF) that signs hub logins
//! and outgoing device messages, and rotating temp keys whose public halves
//! are published to the hub so peers can seal messages to them.
//!
//! Public keys travel as base64 of the 33-byte compressed point. Signatures
//! are 64-byte compact ECDSA (RFC 6979 nonces, low-S), base64 encoded.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::address::{device_address, AddressError};

const WIF_VERSION_MAINNET: u8 = 128;
const WIF_VERSION_TESTNET: u8 = 239;
const WIF_COMPRESSED_FLAG: u8 = 0x01;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid WIF: {0}")]
    Wif(String),
    #[error("signing failed")]
    SigningFailed,
}

fn wif_version(testnet: bool) -> u8 {
    if testnet {
        WIF_VERSION_TESTNET
    } else {
        WIF_VERSION_MAINNET
    }
}

/// Base64 of the compressed SEC1 encoding.
pub fn public_key_b64(key: &PublicKey) -> String {
    B64.encode(key.to_encoded_point(true).as_bytes())
}

/// Parse a base64 compressed (or uncompressed) SEC1 public key.
pub fn decode_public_key(b64: &str) -> Result<PublicKey, IdentityError> {
    let bytes = B64.decode(b64)?;
    PublicKey::from_sec1_bytes(&bytes).map_err(|_| IdentityError::InvalidPublicKey)
}

/// A secp256k1 private key together with its base64 public key.
///
/// The inner `SecretKey` zeroizes itself on drop.
#[derive(Clone)]
pub struct DeviceKey {
    secret: SecretKey,
    pub_b64: String,
}

impl DeviceKey {
    fn from_secret(secret: SecretKey) -> Self {
        let pub_b64 = public_key_b64(&secret.public_key());
        Self { secret, pub_b64 }
    }

    /// Generate a new random key from the OS RNG.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Create a key from a 32-byte big-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 32 {
            return Err(IdentityError::InvalidKeyLength { expected: 32, got: bytes.len() });
        }
        let secret = SecretKey::from_slice(bytes).map_err(|_| IdentityError::InvalidPrivateKey)?;
        Ok(Self::from_secret(secret))
    }

    /// Create a key from base64 of the raw 32-byte scalar.
    pub fn from_base64(b64: &str) -> Result<Self, IdentityError> {
        let raw = Zeroizing::new(B64.decode(b64.trim())?);
        Self::from_bytes(&raw)
    }

    /// Import a wallet-import-format key. The version byte must match the
    /// network; a trailing compression flag is accepted and ignored.
    pub fn from_wif(wif: &str, testnet: bool) -> Result<Self, IdentityError> {
        let version = wif_version(testnet);
        let decoded = Zeroizing::new(
            bs58::decode(wif.trim())
                .with_check(Some(version))
                .into_vec()
                .map_err(|e| IdentityError::Wif(e.to_string()))?,
        );

        let payload = match decoded.split_first() {
            Some((&v, rest)) if v == version => rest,
            _ => return Err(IdentityError::Wif("missing version byte".into())),
        };
        let scalar = match payload.len() {
            32 => payload,
            33 if payload[32] == WIF_COMPRESSED_FLAG => &payload[..32],
            n => return Err(IdentityError::Wif(format!("unexpected payload length {n}"))),
        };
        Self::from_bytes(scalar)
    }

    /// Export as WIF without the compression flag.
    pub fn to_wif(&self, testnet: bool) -> String {
        let raw = self.secret_bytes();
        bs58::encode(raw.as_slice())
            .with_check_version(wif_version(testnet))
            .into_string()
    }

    /// Raw scalar bytes, zeroized when dropped.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Base64 of the raw scalar, the form temp keys are persisted in.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(B64.encode(self.secret_bytes().as_slice()))
    }

    pub fn pub_b64(&self) -> &str {
        &self.pub_b64
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Device address derived from this key's public half.
    pub fn address(&self) -> Result<String, AddressError> {
        device_address(&self.pub_b64)
    }

    /// Sign a 32-byte hash. Returns the base64 compact signature.
    pub fn sign(&self, hash: &[u8]) -> Result<String, IdentityError> {
        let signing_key = SigningKey::from(&self.secret);
        let sig: Signature = signing_key
            .sign_prehash(hash)
            .map_err(|_| IdentityError::SigningFailed)?;
        Ok(B64.encode(sig.to_bytes()))
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey").field("pub_b64", &self.pub_b64).finish_non_exhaustive()
    }
}

/// Sign `hash` with `key`, returning base64.
pub fn sign(hash: &[u8], key: &DeviceKey) -> Result<String, IdentityError> {
    key.sign(hash)
}

/// Verify a base64 signature over `hash` against a base64 public key.
///
/// Malformed keys or signatures yield `false`, never an error.
pub fn verify(hash: &[u8], signature_b64: &str, pub_b64: &str) -> bool {
    let Ok(pub_bytes) = B64.decode(pub_b64) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_sec1_bytes(&pub_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    vk.verify_prehash(hash, &sig).is_ok()
}

/// A temp (ephemeral) device key with a count of how many envelopes it has
/// opened.
#[derive(Debug)]
pub struct TempKey {
    key: DeviceKey,
    use_count: AtomicU64,
}

impl TempKey {
    pub fn new(key: DeviceKey) -> Self {
        Self { key, use_count: AtomicU64::new(0) }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn pub_b64(&self) -> &str {
        self.key.pub_b64()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Record one decryption attempt; returns the updated count.
    pub fn record_use(&self) -> u64 {
        self.use_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl From<DeviceKey> for TempKey {
    fn from(key: DeviceKey) -> Self {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256;

    const TESTNET_WIF: &str = "922Rnwdvd4Y88WnHcrGe5KrWwqBvH8Tf4HvENAhXpLe38Akmoqj";
    const TESTNET_PUB: &str = "ApI/CO2WC2e/3ALxNnGNW0anRJTrOCYzNBcY2EKq7n8o";

    #[test]
    fn test_wif_import_known_key() {
        let key = DeviceKey::from_wif(TESTNET_WIF, true).unwrap();
        assert_eq!(key.pub_b64(), TESTNET_PUB);
        assert_eq!(key.address().unwrap(), "0LULVVKM7U76SD5UDP6IBI7JMYJ2QNWNV");
    }

    #[test]
    fn test_wif_wrong_network_rejected() {
        assert!(matches!(
            DeviceKey::from_wif(TESTNET_WIF, false),
            Err(IdentityError::Wif(_))
        ));
    }

    #[test]
    fn test_wif_round_trip() {
        let key = DeviceKey::generate();
        for testnet in [false, true] {
            let wif = key.to_wif(testnet);
            let back = DeviceKey::from_wif(&wif, testnet).unwrap();
            assert_eq!(back.pub_b64(), key.pub_b64());
        }
    }

    #[test]
    fn test_base64_round_trip() {
        let key = DeviceKey::generate();
        let back = DeviceKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(back.pub_b64(), key.pub_b64());
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(matches!(
            DeviceKey::from_bytes(&[1u8; 31]),
            Err(IdentityError::InvalidKeyLength { expected: 32, got: 31 })
        ));
        assert!(matches!(
            DeviceKey::from_bytes(&[0u8; 32]),
            Err(IdentityError::InvalidPrivateKey)
        ));
    }

    #[test]
    fn test_known_public_key() {
        let key = DeviceKey::from_bytes(&[1u8; 32]).unwrap();
        assert_eq!(key.pub_b64(), "AxuExVZ7EmRAmV0+1aq6BWXXHhg0YEgZ/5wX9enV3QeP");
        assert_eq!(key.pub_b64().len(), 44);
    }

    #[test]
    fn test_sign_verify() {
        let key = DeviceKey::generate();
        let hash = sha256(b"login challenge");
        let sig = sign(&hash, &key).unwrap();
        assert!(verify(&hash, &sig, key.pub_b64()));
        assert_eq!(B64.decode(&sig).unwrap().len(), 64);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let key = DeviceKey::from_bytes(&[7u8; 32]).unwrap();
        let hash = sha256(b"same input");
        assert_eq!(key.sign(&hash).unwrap(), key.sign(&hash).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_key_and_corruption() {
        let key = DeviceKey::generate();
        let other = DeviceKey::generate();
        let hash = sha256(b"payload");
        let sig = key.sign(&hash).unwrap();

        assert!(!verify(&hash, &sig, other.pub_b64()));
        assert!(!verify(&sha256(b"other"), &sig, key.pub_b64()));

        let mut raw = B64.decode(&sig).unwrap();
        raw[10] ^= 0x01;
        assert!(!verify(&hash, &B64.encode(&raw), key.pub_b64()));
    }

    #[test]
    fn test_verify_never_panics_on_garbage() {
        let hash = sha256(b"x");
        assert!(!verify(&hash, "not base64!", TESTNET_PUB));
        assert!(!verify(&hash, "AAAA", TESTNET_PUB));
        assert!(!verify(&hash, &B64.encode([0u8; 64]), "AAAA"));
        assert!(!verify(&hash[..5], &B64.encode([1u8; 64]), TESTNET_PUB));
    }

    #[test]
    fn test_temp_key_use_count() {
        let temp = TempKey::from(DeviceKey::generate());
        assert_eq!(temp.use_count(), 0);
        assert_eq!(temp.record_use(), 1);
        assert_eq!(temp.record_use(), 2);
        assert_eq!(temp.use_count(), 2);
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = DeviceKey::from_bytes(&[1u8; 32]).unwrap();
        let shown = format!("{key:?}");
        assert!(shown.contains(key.pub_b64()));
        assert!(!shown.contains(&*key.to_base64()));
    }
}
