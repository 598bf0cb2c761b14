use serde::{Deserialize, Serialize};
use serde_json::Value;

use hubchat_crypto::envelope::EncryptedPackage;

/// Signed outer wrapper handed to the hub for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_hub: Option<String>,
    pub to: String,
    pub encrypted_package: EncryptedPackage,
    pub pubkey: String, // sender's permanent key, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Body of a `hub/message` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct HubMessage {
    pub message_hash: String,
    pub message: Value, // kept raw so the signature is checked over what was sent
}

/// Signed record a device publishes for its current temp key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempPubkeyRecord {
    pub temp_pubkey: String,
    pub pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Decrypted inner payload of a device message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub device_hub: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub body: Value,
}

/// A decrypted message from a peer device.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// Sender's permanent public key; replies go here.
    pub sender: String,
    /// Sender's device address as claimed inside the payload.
    pub from: Option<String>,
    pub body: Value,
}

impl IncomingMessage {
    /// `body` as text when it is a JSON string.
    pub fn text(&self) -> Option<&str> {
        self.body.as_str()
    }
}

/// Events emitted by a device to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Transport (re)connected; per-connection state must be discarded.
    Connected,
    /// Logged in and temp key published.
    Ready,
    Pairing(IncomingMessage),
    Message(IncomingMessage),
    /// A message was acknowledged to the hub without being delivered.
    Undecryptable { message_hash: String, sender: Option<String> },
    /// The current temp key crossed the configured use threshold.
    RotationDue { use_count: u64 },
}
