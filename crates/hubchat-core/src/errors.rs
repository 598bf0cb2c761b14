//! Error types for hubchat core.
//!
//! Transport failures propagate to the caller of `send`; protocol and crypto
//! failures on inbound events are logged and the event is dropped.

use thiserror::Error;

use hubchat_crypto::address::AddressError;
use hubchat_crypto::canonical::CanonicalError;
use hubchat_crypto::envelope::EnvelopeError;
use hubchat_crypto::identity::IdentityError;

// ============================================================================
// Transport
// ============================================================================

/// Errors raised by a hub channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub answered the request with an error
    #[error("hub rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    /// No response within the transport's deadline
    #[error("hub request timed out: {0}")]
    Timeout(String),

    /// The connection is gone
    #[error("hub connection closed")]
    Closed,
}

// ============================================================================
// Protocol
// ============================================================================

/// Malformed hub events or payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unexpected shape for {field}: {reason}")]
    BadField { field: &'static str, reason: String },

    #[error("unsupported subject: {0}")]
    UnsupportedSubject(String),

    #[error("invalid invite link: {0}")]
    InvalidInvite(String),
}

// ============================================================================
// Crypto
// ============================================================================

/// Signature and key checks that failed on data received from the hub.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signature verification failed for {0}")]
    BadSignature(&'static str),

    #[error("temp pubkey record is for {got}, requested {expected}")]
    TempKeyOwnerMismatch { expected: String, got: String },

    #[error("message could not be decrypted with any temp key")]
    Undecryptable,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),

    #[error("invalid key material: {0}")]
    Key(#[from] IdentityError),
}

// ============================================================================
// Umbrella
// ============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("canonicalization failed: {0}")]
    Canonical(#[from] CanonicalError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("address derivation failed: {0}")]
    Address(#[from] AddressError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("random source unavailable")]
    Random,
}

impl CoreError {
    /// True when the failure came from the hub transport rather than from
    /// local validation.
    pub fn is_transport(&self) -> bool {
        matches!(self, CoreError::Hub(_))
    }
}
