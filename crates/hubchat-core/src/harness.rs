//! In-process hubs for tests and demos.
//!
//! - [`RecordingHub`] records every outbound call and answers requests from
//!   a script.
//! - [`MemoryHub`] is a working store-and-forward relay: it issues
//!   challenges, checks logins, stores signed temp keys and holds device
//!   messages until the recipient deletes them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hubchat_crypto::address::device_address;
use hubchat_crypto::canonical::{hash_for_signing, source_string};
use hubchat_crypto::hash::sha256;
use hubchat_crypto::identity::verify;

use crate::errors::HubError;
use crate::hub::{subjects, HubChannel, HubEvent};
use crate::types::{DeviceMessage, TempPubkeyRecord};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejected(command: &str, reason: impl Into<String>) -> HubError {
    HubError::Rejected { command: command.to_string(), reason: reason.into() }
}

/// Valid signature over `hash_for_signing(value)` by `value.pubkey`.
fn signed_by_pubkey(value: &Value) -> bool {
    let (Some(pubkey), Some(signature)) = (
        value.get("pubkey").and_then(Value::as_str),
        value.get("signature").and_then(Value::as_str),
    ) else {
        return false;
    };
    hash_for_signing(value).map(|hash| verify(&hash, signature, pubkey)).unwrap_or(false)
}

// ============================================================================
// Recording hub
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Notify,
    Post,
    Request,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub subject: String,
    pub body: Value,
}

#[derive(Default)]
pub struct RecordingHub {
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, HubError>>>>,
}

impl RecordingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response for the next `request(command, _)`.
    pub fn respond(&self, command: &str, response: Result<Value, HubError>) {
        lock(&self.responses).entry(command.to_string()).or_default().push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Subjects of all recorded calls, in order.
    pub fn subjects(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.subject.clone()).collect()
    }

    pub fn calls_to(&self, subject: &str) -> Vec<RecordedCall> {
        lock(&self.calls).iter().filter(|c| c.subject == subject).cloned().collect()
    }

    fn record(&self, kind: CallKind, subject: &str, body: Value) {
        lock(&self.calls).push(RecordedCall { kind, subject: subject.to_string(), body });
    }
}

#[async_trait]
impl HubChannel for RecordingHub {
    fn notify(&self, subject: &str, body: Value) -> Result<(), HubError> {
        self.record(CallKind::Notify, subject, body);
        Ok(())
    }

    fn post(&self, command: &str, params: Value) -> Result<(), HubError> {
        self.record(CallKind::Post, command, params);
        Ok(())
    }

    async fn request(&self, command: &str, params: Value) -> Result<Value, HubError> {
        self.record(CallKind::Request, command, params);
        lock(&self.responses)
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(rejected(command, "no scripted response")))
    }
}

// ============================================================================
// Memory relay hub
// ============================================================================

struct Connection {
    tx: mpsc::UnboundedSender<HubEvent>,
    challenge: String,
    pubkey: Option<String>,
}

impl Connection {
    fn push(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            debug!("device event channel closed");
        }
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    connections: HashMap<u64, Connection>,
    temp_pubkeys: HashMap<String, Value>,
    /// Device address -> (message hash, message), oldest first
    mailboxes: HashMap<String, Vec<(String, Value)>>,
}

impl HubState {
    fn connection(&mut self, id: u64) -> Result<&mut Connection, HubError> {
        self.connections.get_mut(&id).ok_or(HubError::Closed)
    }

    fn logged_in(&mut self, id: u64, command: &str) -> Result<String, HubError> {
        self.connection(id)?.pubkey.clone().ok_or_else(|| rejected(command, "not logged in"))
    }

    fn push_stored(&self, id: u64, address: &str) {
        let (Some(conn), Some(mailbox)) = (self.connections.get(&id), self.mailboxes.get(address))
        else {
            return;
        };
        for (hash, message) in mailbox {
            conn.push(message_event(hash, message));
        }
    }
}

fn message_event(hash: &str, message: &Value) -> HubEvent {
    HubEvent::justsaying(subjects::MESSAGE, json!({ "message_hash": hash, "message": message }))
}

fn new_challenge() -> Result<String, HubError> {
    let mut raw = [0u8; 30];
    getrandom::getrandom(&mut raw).map_err(|_| HubError::Closed)?;
    Ok(B64.encode(raw))
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a device connection. The hub greets it with `Connected` and a
    /// challenge.
    pub fn connect(&self) -> Result<(HubConnection, mpsc::UnboundedReceiver<HubEvent>), HubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let challenge = new_challenge()?;

        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        let conn = Connection { tx, challenge: challenge.clone(), pubkey: None };
        conn.push(HubEvent::Connected);
        conn.push(HubEvent::justsaying(subjects::CHALLENGE, Value::String(challenge)));
        state.connections.insert(id, conn);

        Ok((HubConnection { hub: self.clone(), id }, rx))
    }

    /// Simulate a transport drop and reconnect on an existing connection.
    pub fn reconnect(&self, conn: &HubConnection) -> Result<(), HubError> {
        let challenge = new_challenge()?;
        let mut state = lock(&self.state);
        let c = state.connection(conn.id)?;
        c.pubkey = None;
        c.challenge = challenge.clone();
        c.push(HubEvent::Connected);
        c.push(HubEvent::justsaying(subjects::CHALLENGE, Value::String(challenge)));
        Ok(())
    }

    /// Messages waiting for `address`.
    pub fn stored_count(&self, address: &str) -> usize {
        lock(&self.state).mailboxes.get(address).map_or(0, Vec::len)
    }

    pub fn is_logged_in(&self, pubkey: &str) -> bool {
        lock(&self.state).connections.values().any(|c| c.pubkey.as_deref() == Some(pubkey))
    }

    pub fn has_temp_pubkey(&self, pubkey: &str) -> bool {
        lock(&self.state).temp_pubkeys.contains_key(pubkey)
    }

    /// Store a raw message for `address` as if delivered by a peer.
    pub fn inject(&self, address: &str, message: Value) -> Result<String, HubError> {
        let hash = message_hash(&message)?;
        let mut state = lock(&self.state);
        for conn in state.connections.values() {
            if let Some(pk) = &conn.pubkey {
                if device_address(pk).ok().as_deref() == Some(address) {
                    conn.push(message_event(&hash, &message));
                }
            }
        }
        state
            .mailboxes
            .entry(address.to_string())
            .or_default()
            .push((hash.clone(), message));
        Ok(hash)
    }

    fn login(&self, id: u64, body: &Value) -> Result<(), HubError> {
        let mut state = lock(&self.state);
        let conn = state.connection(id)?;
        let challenge_ok =
            body.get("challenge").and_then(Value::as_str) == Some(conn.challenge.as_str());
        if !challenge_ok || !signed_by_pubkey(body) {
            warn!("hub login rejected");
            return Err(rejected(subjects::LOGIN, "bad challenge signature"));
        }
        let pubkey = body.get("pubkey").and_then(Value::as_str).unwrap_or_default().to_string();
        conn.pubkey = Some(pubkey);
        Ok(())
    }

    fn store_temp_pubkey(&self, id: u64, params: Value) -> Result<(), HubError> {
        let mut state = lock(&self.state);
        let pubkey = state.logged_in(id, subjects::TEMP_PUBKEY)?;
        let record: TempPubkeyRecord = serde_json::from_value(params.clone())
            .map_err(|e| rejected(subjects::TEMP_PUBKEY, e.to_string()))?;
        if record.pubkey != pubkey || !signed_by_pubkey(&params) {
            return Err(rejected(subjects::TEMP_PUBKEY, "bad temp pubkey signature"));
        }
        state.temp_pubkeys.insert(pubkey, params);
        Ok(())
    }

    fn refresh(&self, id: u64) -> Result<(), HubError> {
        let mut state = lock(&self.state);
        let pubkey = state.logged_in(id, subjects::REFRESH)?;
        let address = device_address(&pubkey).map_err(|e| rejected(subjects::REFRESH, e.to_string()))?;
        state.push_stored(id, &address);
        Ok(())
    }

    fn delete(&self, id: u64, body: &Value) -> Result<(), HubError> {
        let mut state = lock(&self.state);
        let pubkey = state.logged_in(id, subjects::DELETE)?;
        let hash = body.as_str().ok_or_else(|| rejected(subjects::DELETE, "expected hash"))?;
        let address = device_address(&pubkey).map_err(|e| rejected(subjects::DELETE, e.to_string()))?;
        if let Some(mailbox) = state.mailboxes.get_mut(&address) {
            mailbox.retain(|(h, _)| h != hash);
        }
        Ok(())
    }

    fn repeat_challenge(&self, id: u64) -> Result<(), HubError> {
        let challenge = new_challenge()?;
        let mut state = lock(&self.state);
        let conn = state.connection(id)?;
        conn.challenge = challenge.clone();
        conn.push(HubEvent::justsaying(subjects::CHALLENGE, Value::String(challenge)));
        Ok(())
    }

    fn get_temp_pubkey(&self, params: &Value) -> Result<Value, HubError> {
        let pubkey = params
            .as_str()
            .ok_or_else(|| rejected(subjects::GET_TEMP_PUBKEY, "expected pubkey"))?;
        lock(&self.state)
            .temp_pubkeys
            .get(pubkey)
            .cloned()
            .ok_or_else(|| rejected(subjects::GET_TEMP_PUBKEY, "no temp key for device"))
    }

    fn deliver(&self, id: u64, params: Value) -> Result<Value, HubError> {
        {
            let mut state = lock(&self.state);
            state.logged_in(id, subjects::DELIVER)?;
        }
        let message: DeviceMessage = serde_json::from_value(params.clone())
            .map_err(|e| rejected(subjects::DELIVER, e.to_string()))?;
        if !signed_by_pubkey(&params) {
            return Err(rejected(subjects::DELIVER, "bad message signature"));
        }
        self.inject(&message.to, params)?;
        Ok(Value::String("accepted".to_string()))
    }
}

/// Base64 SHA-256 of the canonical form of `message`.
pub fn message_hash(message: &Value) -> Result<String, HubError> {
    let source = source_string(message).map_err(|e| rejected(subjects::DELIVER, e.to_string()))?;
    Ok(B64.encode(sha256(source.as_bytes())))
}

/// One device's connection to a [`MemoryHub`].
#[derive(Clone)]
pub struct HubConnection {
    hub: MemoryHub,
    id: u64,
}

impl HubConnection {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl HubChannel for HubConnection {
    fn notify(&self, subject: &str, body: Value) -> Result<(), HubError> {
        match subject {
            subjects::LOGIN => self.hub.login(self.id, &body),
            subjects::REFRESH => self.hub.refresh(self.id),
            subjects::DELETE => self.hub.delete(self.id, &body),
            subjects::REPEAT_CHALLENGE => self.hub.repeat_challenge(self.id),
            other => Err(rejected(other, "unknown subject")),
        }
    }

    fn post(&self, command: &str, params: Value) -> Result<(), HubError> {
        match command {
            subjects::TEMP_PUBKEY => self.hub.store_temp_pubkey(self.id, params),
            other => Err(rejected(other, "unknown command")),
        }
    }

    async fn request(&self, command: &str, params: Value) -> Result<Value, HubError> {
        match command {
            subjects::GET_TEMP_PUBKEY => self.hub.get_temp_pubkey(&params),
            subjects::DELIVER => self.hub.deliver(self.id, params),
            other => Err(rejected(other, "unknown command")),
        }
    }
}
