//! Device protocol state machine.
//!
//! One `DeviceProtocol` owns one device's session with its hub:
//! - answers the hub challenge with a signed login
//! - publishes the current temp key and asks for queued messages
//! - verifies, decrypts and routes inbound device messages
//! - seals and delivers outbound messages
//!
//! Hub events must be fed from a single task (see [`DeviceProtocol::start`]).
//! `send` may be called concurrently from anywhere.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hubchat_crypto::address::device_address;
use hubchat_crypto::canonical::hash_for_signing;
use hubchat_crypto::envelope::{open, seal};
use hubchat_crypto::identity::verify;

use crate::config::DeviceConfig;
use crate::errors::{CoreError, CryptoError, ProtocolError};
use crate::hub::{subjects, HubChannel, HubEvent};
use crate::keys::DeviceKeys;
use crate::types::{
    DeviceEvent, DeviceMessage, HubMessage, IncomingMessage, PlainMessage, TempPubkeyRecord,
};

const EVENT_CAPACITY: usize = 64;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Connecting,
    Challenged,
    Authenticated,
    Ready,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Connecting => "connecting",
            DeviceState::Challenged => "challenged",
            DeviceState::Authenticated => "authenticated",
            DeviceState::Ready => "ready",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Inbound `hub/message` events
    pub received: AtomicU64,
    /// Decrypted messages routed to a subject handler
    pub dispatched: AtomicU64,
    pub signature_failures: AtomicU64,
    pub decryption_failures: AtomicU64,
    /// Messages acknowledged for deletion at the hub
    pub acknowledged: AtomicU64,
    /// Outbound messages accepted by the hub
    pub sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub signature_failures: u64,
    pub decryption_failures: u64,
    pub acknowledged: u64,
    pub sent: u64,
}

impl DeviceStats {
    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            decryption_failures: self.decryption_failures.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Protocol
// ============================================================================

pub struct DeviceProtocol<H: HubChannel> {
    hub: H,
    keys: DeviceKeys,
    address: String,
    hub_host: String,
    device_name: String,
    state: Mutex<DeviceState>,
    events: broadcast::Sender<DeviceEvent>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<DeviceEvent>>>,
    stats: DeviceStats,
    recovery_timeout: Duration,
    rotation_hint: Option<u64>,
    rotation_signalled: AtomicBool,
}

impl<H: HubChannel> DeviceProtocol<H> {
    pub fn new(
        hub: H,
        keys: DeviceKeys,
        hub_host: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let address = keys.identity.address()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            hub,
            keys,
            address,
            hub_host: hub_host.into(),
            device_name: device_name.into(),
            state: Mutex::new(DeviceState::Connecting),
            events,
            listeners: Mutex::new(Vec::new()),
            stats: DeviceStats::default(),
            recovery_timeout: Duration::from_millis(500),
            rotation_hint: None,
            rotation_signalled: AtomicBool::new(false),
        })
    }

    pub fn from_config(hub: H, config: &DeviceConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let keys = DeviceKeys::from_config(config)?;
        let mut device = Self::new(hub, keys, config.hub_host(), config.display_name.clone())?;
        device.recovery_timeout = config.recovery_timeout();
        device.rotation_hint = config.temp_key_rotation_hint;
        Ok(device)
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_rotation_hint(mut self, uses: u64) -> Self {
        self.rotation_hint = Some(uses);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pubkey(&self) -> &str {
        self.keys.identity.pub_b64()
    }

    pub fn hub_host(&self) -> &str {
        &self.hub_host
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn keys(&self) -> &DeviceKeys {
        &self.keys
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DeviceState::Ready
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.stats.snapshot()
    }

    /// Bounded event stream. A reader that falls behind by more than
    /// `EVENT_CAPACITY` events loses the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Event stream that never drops events, for consumers that must see
    /// every reconnect and pairing.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    fn set_state(&self, next: DeviceState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            info!(address = %self.address, from = %*state, to = %next, "device state");
            *state = next;
        }
    }

    fn emit(&self, event: DeviceEvent) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Sign `value` with the identity key, inserting its `signature` field.
    fn sign_object(&self, value: &mut Value) -> Result<(), CoreError> {
        let hash = hash_for_signing(value)?;
        let signature = self.keys.identity.sign(&hash)?;
        match value {
            Value::Object(map) => {
                map.insert("signature".to_string(), Value::String(signature));
                Ok(())
            }
            _ => Err(ProtocolError::BadField {
                field: "signature",
                reason: "only objects can be signed".to_string(),
            }
            .into()),
        }
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    pub async fn handle_event(&self, event: HubEvent) -> Result<(), CoreError> {
        match event {
            HubEvent::Connected => {
                self.set_state(DeviceState::Connecting);
                self.emit(DeviceEvent::Connected);
                Ok(())
            }
            HubEvent::Justsaying { subject, body } => match subject.as_str() {
                subjects::CHALLENGE => self.handle_challenge(body),
                subjects::MESSAGE => self.handle_message(body).await,
                other => {
                    debug!(subject = other, "ignoring hub notification");
                    Ok(())
                }
            },
        }
    }

    fn handle_challenge(&self, body: Value) -> Result<(), CoreError> {
        let challenge = body.as_str().ok_or(ProtocolError::BadField {
            field: "challenge",
            reason: "expected a string".to_string(),
        })?;
        self.set_state(DeviceState::Challenged);

        let mut login = json!({ "challenge": challenge, "pubkey": self.pubkey() });
        self.sign_object(&mut login)?;
        self.hub.notify(subjects::LOGIN, login)?;
        self.set_state(DeviceState::Authenticated);

        let mut temp = serde_json::to_value(TempPubkeyRecord {
            temp_pubkey: self.keys.current.pub_b64().to_string(),
            pubkey: self.pubkey().to_string(),
            signature: None,
        })?;
        self.sign_object(&mut temp)?;
        self.hub.post(subjects::TEMP_PUBKEY, temp)?;
        self.hub.notify(subjects::REFRESH, Value::Null)?;

        self.set_state(DeviceState::Ready);
        self.emit(DeviceEvent::Ready);
        Ok(())
    }

    async fn handle_message(&self, body: Value) -> Result<(), CoreError> {
        DeviceStats::inc(&self.stats.received);
        let HubMessage { message_hash, message } = serde_json::from_value(body).map_err(|e| {
            ProtocolError::BadField { field: "hub/message", reason: e.to_string() }
        })?;

        if let Err(e) = self.dispatch(&message_hash, &message).await {
            warn!(%message_hash, error = %e, "message discarded");
        }

        // Acknowledged whatever happened above: the hub never redelivers.
        self.hub.notify(subjects::DELETE, Value::String(message_hash.clone()))?;
        DeviceStats::inc(&self.stats.acknowledged);
        debug!(%message_hash, "message acknowledged");
        Ok(())
    }

    async fn dispatch(&self, message_hash: &str, raw: &Value) -> Result<(), CoreError> {
        let message: DeviceMessage = serde_json::from_value(raw.clone())
            .map_err(|e| ProtocolError::BadField { field: "message", reason: e.to_string() })?;

        if !self.signature_valid(raw, &message) {
            DeviceStats::inc(&self.stats.signature_failures);
            return Err(CryptoError::BadSignature("device message").into());
        }

        let Some(plain) = self.decrypt(&message) else {
            DeviceStats::inc(&self.stats.decryption_failures);
            self.emit(DeviceEvent::Undecryptable {
                message_hash: message_hash.to_string(),
                sender: Some(message.pubkey.clone()),
            });
            return Err(CryptoError::Undecryptable.into());
        };
        self.check_rotation();

        let plain: PlainMessage = serde_json::from_value(plain)
            .map_err(|e| ProtocolError::BadField { field: "payload", reason: e.to_string() })?;
        let incoming = IncomingMessage {
            sender: message.pubkey,
            from: plain.from,
            body: plain.body,
        };

        match plain.subject.as_str() {
            "pairing" => {
                DeviceStats::inc(&self.stats.dispatched);
                self.handle_pairing(incoming).await;
            }
            "text" => {
                DeviceStats::inc(&self.stats.dispatched);
                debug!(sender = %incoming.sender, "text message");
                self.emit(DeviceEvent::Message(incoming));
            }
            other => debug!(subject = other, "ignoring message subject"),
        }
        Ok(())
    }

    fn signature_valid(&self, raw: &Value, message: &DeviceMessage) -> bool {
        let Some(signature) = &message.signature else {
            return false;
        };
        match hash_for_signing(raw) {
            Ok(hash) => verify(&hash, signature, &message.pubkey),
            Err(_) => false,
        }
    }

    /// Try the current temp key, then the previous one.
    fn decrypt(&self, message: &DeviceMessage) -> Option<Value> {
        for key in self.keys.temp_keys() {
            match open(&message.encrypted_package, key) {
                Ok(value) => return Some(value),
                Err(e) => debug!(temp_pubkey = key.pub_b64(), error = %e, "decrypt attempt failed"),
            }
        }
        None
    }

    fn check_rotation(&self) {
        let Some(limit) = self.rotation_hint else {
            return;
        };
        let use_count = self.keys.current.use_count();
        if use_count >= limit && !self.rotation_signalled.swap(true, Ordering::Relaxed) {
            info!(use_count, limit, "temp key rotation due");
            self.emit(DeviceEvent::RotationDue { use_count });
        }
    }

    async fn handle_pairing(&self, incoming: IncomingMessage) {
        if let Some(reverse) = incoming.body.get("reverse_pairing_secret").and_then(Value::as_str) {
            let reply = json!({ "pairing_secret": reverse, "device_name": self.device_name });
            if let Err(e) = self.send(&incoming.sender, "pairing", reply).await {
                warn!(sender = %incoming.sender, error = %e, "pairing reply failed");
            }
        }
        info!(sender = %incoming.sender, "paired");
        self.emit(DeviceEvent::Pairing(incoming));
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Fetch and check the recipient's current temp key.
    pub async fn get_temp_pubkey(&self, recipient_pubkey: &str) -> Result<String, CoreError> {
        let response = self
            .hub
            .request(subjects::GET_TEMP_PUBKEY, Value::String(recipient_pubkey.to_string()))
            .await?;
        let record: TempPubkeyRecord = serde_json::from_value(response.clone())?;

        if record.pubkey != recipient_pubkey {
            return Err(CryptoError::TempKeyOwnerMismatch {
                expected: recipient_pubkey.to_string(),
                got: record.pubkey,
            }
            .into());
        }
        let signature = record.signature.as_deref().ok_or(ProtocolError::MissingField("signature"))?;
        if !verify(&hash_for_signing(&response)?, signature, &record.pubkey) {
            return Err(CryptoError::BadSignature("temp pubkey").into());
        }
        Ok(record.temp_pubkey)
    }

    /// Seal `body` under `subject` to `recipient_pubkey` and hand it to the hub.
    pub async fn send(
        &self,
        recipient_pubkey: &str,
        subject: &str,
        body: Value,
    ) -> Result<Value, CoreError> {
        let temp_pubkey = self.get_temp_pubkey(recipient_pubkey).await?;

        let plain = PlainMessage {
            from: Some(self.address.clone()),
            device_hub: Some(self.hub_host.clone()),
            subject: subject.to_string(),
            body,
        };
        let package = seal(&serde_json::to_value(&plain)?, &temp_pubkey)?;

        let message = DeviceMessage {
            from: Some(self.address.clone()),
            device_hub: Some(self.hub_host.clone()),
            to: device_address(recipient_pubkey)?,
            encrypted_package: package,
            pubkey: self.pubkey().to_string(),
            signature: None,
        };
        let mut value = serde_json::to_value(&message)?;
        self.sign_object(&mut value)?;

        let response = self.hub.request(subjects::DELIVER, value).await?;
        DeviceStats::inc(&self.stats.sent);
        debug!(to = %message.to, subject, "message delivered to hub");
        Ok(response)
    }

    /// Reply with a `text` message to the sender of `message`.
    pub async fn reply(&self, message: &IncomingMessage, body: Value) -> Result<Value, CoreError> {
        self.send(&message.sender, "text", body).await
    }
}

impl<H: HubChannel + 'static> DeviceProtocol<H> {
    /// Arm the recovery timer and spawn the hub event pump.
    pub fn start(
        self: &Arc<Self>,
        hub_events: mpsc::UnboundedReceiver<HubEvent>,
    ) -> JoinHandle<()> {
        self.spawn_recovery_timer();
        tokio::spawn(Arc::clone(self).run(hub_events))
    }

    /// Drain hub events one at a time until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                warn!(address = %self.address, error = %e, "hub event dropped");
            }
        }
        debug!(address = %self.address, "hub event stream closed");
    }

    /// One-shot timer: if not ready when it fires, ask the hub to repeat its
    /// challenge once.
    pub fn spawn_recovery_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let device = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(device.recovery_timeout).await;
            if device.is_ready() {
                return;
            }
            info!(address = %device.address, "not ready, requesting a new challenge");
            if let Err(e) = device.hub.notify(subjects::REPEAT_CHALLENGE, Value::Null) {
                warn!(error = %e, "repeat challenge failed");
            }
        })
    }
}
