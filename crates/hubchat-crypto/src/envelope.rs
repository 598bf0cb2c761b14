//! Encrypted packages: per-message ECDH on secp256k1 + AES-128-GCM.
//!
//! Sealing generates a single-use ephemeral key pair, derives a 128-bit key
//! as the first 16 bytes of SHA-256 of the ECDH x-coordinate, and encrypts
//! the JSON text of the plaintext under a fresh 12-byte nonce.
//!
//! Opening recurses when the decrypted value itself carries an
//! `encrypted_package` (a hub-relayed re-wrap), up to [`MAX_ONION_DEPTH`]
//! layers.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce, Tag};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::PublicKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::hash::sha256;
use crate::identity::{decode_public_key, public_key_b64, TempKey};

/// Maximum number of nested envelopes `open` will unwrap.
pub const MAX_ONION_DEPTH: usize = 8;

/// Field that marks a decrypted value as another envelope.
pub const NESTED_FIELD: &str = "encrypted_package";

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid key bytes")]
    InvalidKeyBytes,
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("plaintext is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope nesting exceeds {MAX_ONION_DEPTH} layers")]
    TooDeep,
}

/// Public keys involved in the key agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhKeys {
    pub sender_ephemeral_pubkey: String,
    pub recipient_ephemeral_pubkey: String,
}

/// Wire form of an encrypted package; all binary fields base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPackage {
    pub encrypted_message: String,
    pub iv: String,
    pub authtag: String,
    pub dh: DhKeys,
}

impl EncryptedPackage {
    pub fn to_value(&self) -> Result<Value, EnvelopeError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn derive_key(shared_x: &[u8]) -> Zeroizing<[u8; 16]> {
    let digest = Zeroizing::new(sha256(shared_x));
    let mut key = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&digest[..16]);
    key
}

fn decode_field(field: &'static str, b64: &str) -> Result<Vec<u8>, EnvelopeError> {
    B64.decode(b64).map_err(|e| EnvelopeError::Malformed { field, reason: e.to_string() })
}

fn recipient_key(b64: &str) -> Result<PublicKey, EnvelopeError> {
    decode_public_key(b64).map_err(|_| EnvelopeError::InvalidKeyBytes)
}

/// Seal `plaintext` to the holder of `recipient_pub_b64`.
pub fn seal(plaintext: &Value, recipient_pub_b64: &str) -> Result<EncryptedPackage, EnvelopeError> {
    let recipient = recipient_key(recipient_pub_b64)?;

    let eph = EphemeralSecret::random(&mut OsRng);
    let eph_pub = public_key_b64(&eph.public_key());
    let shared = eph.diffie_hellman(&recipient);
    let key = derive_key(shared.raw_secret_bytes());

    let mut iv = [0u8; IV_LEN];
    getrandom::getrandom(&mut iv).map_err(|_| EnvelopeError::EncryptFailed)?;

    let mut buf = serde_json::to_vec(plaintext)?;
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_slice()));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf)
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    Ok(EncryptedPackage {
        encrypted_message: B64.encode(&buf),
        iv: B64.encode(iv),
        authtag: B64.encode(tag),
        dh: DhKeys {
            sender_ephemeral_pubkey: eph_pub,
            recipient_ephemeral_pubkey: recipient_pub_b64.to_string(),
        },
    })
}

fn open_layer(pkg: &EncryptedPackage, key: &TempKey) -> Result<Value, EnvelopeError> {
    key.record_use();

    let sender = recipient_key(&pkg.dh.sender_ephemeral_pubkey)?;
    let iv = decode_field("iv", &pkg.iv)?;
    let tag = decode_field("authtag", &pkg.authtag)?;
    let mut buf = decode_field("encrypted_message", &pkg.encrypted_message)?;

    if iv.len() != IV_LEN {
        return Err(EnvelopeError::Malformed { field: "iv", reason: format!("{} bytes", iv.len()) });
    }
    if tag.len() != TAG_LEN {
        return Err(EnvelopeError::Malformed {
            field: "authtag",
            reason: format!("{} bytes", tag.len()),
        });
    }

    let shared = diffie_hellman(key.key().secret_key().to_nonzero_scalar(), sender.as_affine());
    let sym = derive_key(shared.raw_secret_bytes());

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(sym.as_slice()));
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf, Tag::from_slice(&tag))
        .map_err(|_| EnvelopeError::DecryptFailed)?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Open `pkg` with `key`, unwrapping nested envelopes.
pub fn open(pkg: &EncryptedPackage, key: &TempKey) -> Result<Value, EnvelopeError> {
    let mut value = open_layer(pkg, key)?;
    for _ in 1..MAX_ONION_DEPTH {
        let Some(inner) = value.get(NESTED_FIELD) else {
            return Ok(value);
        };
        let inner: EncryptedPackage = serde_json::from_value(inner.clone())?;
        value = open_layer(&inner, key)?;
    }
    if value.get(NESTED_FIELD).is_some() {
        return Err(EnvelopeError::TooDeep);
    }
    Ok(value)
}
