//! Chat session layer: invites, pairing links and pairing-triggered delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use hubchat_crypto::utils::secrets_match;

use crate::device::DeviceProtocol;
use crate::errors::{CoreError, ProtocolError};
use crate::hub::{HubChannel, HubEvent};
use crate::types::{DeviceEvent, IncomingMessage};

/// Fragment of the generic pairing link.
pub const DEFAULT_PAIRING_SECRET: &str = "0000";

/// A message queued until the peer holding `request_id` pairs.
#[derive(Debug, Clone)]
struct PendingPairing {
    request_id: String,
    message: Value,
}

/// `obyte[-tn]:<pubkey>@<hub_host>`
pub fn invite_string(pubkey: &str, hub_host: &str, testnet: bool) -> String {
    let scheme = if testnet { "obyte-tn" } else { "obyte" };
    format!("{scheme}:{pubkey}@{hub_host}")
}

/// Base64 of the JSON text of `payments`, for embedding in a chat message.
pub fn generate_payment_string(payments: &Value) -> Result<String, CoreError> {
    Ok(B64.encode(serde_json::to_vec(payments)?))
}

/// An invite link split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingInvite {
    pub testnet: bool,
    pub pubkey: String,
    pub hub_host: String,
    pub pairing_secret: Option<String>,
}

impl PairingInvite {
    pub fn parse(link: &str) -> Result<Self, ProtocolError> {
        let bad = |reason: &str| ProtocolError::InvalidInvite(format!("{reason}: {link}"));

        let (scheme, rest) = link.split_once(':').ok_or_else(|| bad("missing scheme"))?;
        let testnet = match scheme {
            "obyte" => false,
            "obyte-tn" => true,
            _ => return Err(bad("unknown scheme")),
        };
        let (rest, pairing_secret) = match rest.split_once('#') {
            Some((head, secret)) if !secret.is_empty() => (head, Some(secret.to_string())),
            Some(_) => return Err(bad("empty pairing secret")),
            None => (rest, None),
        };
        // Base64 never contains '@', so the first one splits key from host.
        let (pubkey, hub_host) = rest.split_once('@').ok_or_else(|| bad("missing hub"))?;
        if pubkey.is_empty() || hub_host.is_empty() {
            return Err(bad("empty key or hub"));
        }
        Ok(Self {
            testnet,
            pubkey: pubkey.to_string(),
            hub_host: hub_host.to_string(),
            pairing_secret,
        })
    }
}

pub struct ChatSession<H: HubChannel> {
    device: Arc<DeviceProtocol<H>>,
    invite: String,
    pending: Mutex<Vec<PendingPairing>>,
    ready: AtomicBool,
}

impl<H: HubChannel> ChatSession<H> {
    fn new(device: Arc<DeviceProtocol<H>>, testnet: bool) -> Self {
        let invite = invite_string(device.pubkey(), device.hub_host(), testnet);
        Self {
            device,
            invite,
            pending: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &Arc<DeviceProtocol<H>> {
        &self.device
    }

    pub fn invite(&self) -> &str {
        &self.invite
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.device.subscribe()
    }

    pub fn get_pairing_link(&self) -> String {
        format!("{}#{}", self.invite, DEFAULT_PAIRING_SECRET)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Queue `message` for whoever pairs with the returned link.
    pub fn send_after_pairing(&self, message: impl Into<Value>) -> Result<String, CoreError> {
        let mut id = [0u8; 32];
        getrandom::getrandom(&mut id).map_err(|_| CoreError::Random)?;
        let request_id = B64.encode(id);

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingPairing { request_id: request_id.clone(), message: message.into() });
        debug!("queued message until pairing");
        Ok(format!("{}#{}", self.invite, request_id))
    }

    fn take_pending(&self, secret: &str) -> Option<PendingPairing> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = pending.iter().position(|p| secrets_match(&p.request_id, secret))?;
        Some(pending.remove(idx))
    }

    pub async fn handle_device_event(&self, event: &DeviceEvent) -> Result<(), CoreError> {
        match event {
            DeviceEvent::Connected => {
                self.ready.store(false, Ordering::Relaxed);
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                if !pending.is_empty() {
                    info!(dropped = pending.len(), "connection reset, pending pairings cleared");
                }
                pending.clear();
            }
            DeviceEvent::Ready => {
                self.ready.store(true, Ordering::Relaxed);
                info!(invite = %self.invite, "chat ready");
            }
            DeviceEvent::Pairing(msg) => self.deliver_pending(msg).await?,
            _ => {}
        }
        Ok(())
    }

    async fn deliver_pending(&self, msg: &IncomingMessage) -> Result<(), CoreError> {
        let Some(secret) = msg.body.get("pairing_secret").and_then(Value::as_str) else {
            return Ok(());
        };
        // Removed before sending: delivery is one-shot even if the send fails.
        let Some(entry) = self.take_pending(secret) else {
            return Ok(());
        };
        info!(sender = %msg.sender, "pairing matched a queued message");
        self.device.reply(msg, entry.message).await?;
        Ok(())
    }
}

impl<H: HubChannel + 'static> ChatSession<H> {
    /// Attach a chat session to `device` and start both.
    ///
    /// The session listens on the device's lossless stream before the hub
    /// pump starts, so no reconnect or pairing can slip past it. The device's
    /// recovery timer is armed here.
    pub fn start(
        device: Arc<DeviceProtocol<H>>,
        hub_events: mpsc::UnboundedReceiver<HubEvent>,
        testnet: bool,
    ) -> Arc<Self> {
        let session = Arc::new(Self::new(Arc::clone(&device), testnet));
        tokio::spawn(Arc::clone(&session).run(device.listen()));
        device.start(hub_events);
        session
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_device_event(&event).await {
                warn!(error = %e, "device event handling failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::harness::RecordingHub;
    use crate::hub::subjects;
    use crate::keys::DeviceKeys;

    fn device(hub: &Arc<RecordingHub>) -> Arc<DeviceProtocol<Arc<RecordingHub>>> {
        Arc::new(
            DeviceProtocol::new(hub.clone(), DeviceKeys::generate(), "obyte.org/bb-test", "service")
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_reconnect_clears_pending_after_event_burst() {
        let hub = Arc::new(RecordingHub::new());
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let chat = ChatSession::start(device(&hub), hub_rx, true);
        chat.send_after_pairing("queued").unwrap();

        // More events than the bounded stream holds, all queued before the
        // session task gets to run.
        hub_tx.send(HubEvent::Connected).unwrap();
        for i in 0..80 {
            hub_tx
                .send(HubEvent::justsaying(subjects::CHALLENGE, json!(format!("c{i}"))))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while chat.pending_count() != 0 || hub.calls_to(subjects::LOGIN).len() < 80 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reconnect did not clear pending pairings");
        assert_eq!(chat.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requests_challenge_once_when_hub_is_silent() {
        let hub = Arc::new(RecordingHub::new());
        let (_hub_tx, hub_rx) = mpsc::unbounded_channel();
        let chat = ChatSession::start(device(&hub), hub_rx, true);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hub.calls_to(subjects::REPEAT_CHALLENGE).len(), 1);
        assert!(!chat.is_ready());
    }

    #[test]
    fn test_invite_string() {
        assert_eq!(
            invite_string("ApI/CO2W", "obyte.org/bb-test", true),
            "obyte-tn:ApI/CO2W@obyte.org/bb-test"
        );
        assert_eq!(invite_string("K", "obyte.org/bb", false), "obyte:K@obyte.org/bb");
    }

    #[test]
    fn test_parse_invite() {
        let inv = PairingInvite::parse("obyte-tn:ApI/CO2W+8=@obyte.org/bb-test#abc+/=").unwrap();
        assert!(inv.testnet);
        assert_eq!(inv.pubkey, "ApI/CO2W+8=");
        assert_eq!(inv.hub_host, "obyte.org/bb-test");
        assert_eq!(inv.pairing_secret.as_deref(), Some("abc+/="));

        let inv = PairingInvite::parse("obyte:K@obyte.org/bb").unwrap();
        assert!(!inv.testnet);
        assert_eq!(inv.pairing_secret, None);

        for bad in ["byteball:K@h", "obyte:K", "obyte:@h", "obyte:K@h#", "nothing"] {
            assert!(PairingInvite::parse(bad).is_err(), "{bad}");
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_invite_link_parses_back(
            key in "[A-Za-z0-9+/]{43}=",
            host in "[a-z]{1,12}\\.[a-z]{2,4}(/[a-z-]{1,8})?",
            secret in "[A-Za-z0-9+/=]{1,44}",
            testnet: bool,
        ) {
            let link = format!("{}#{}", invite_string(&key, &host, testnet), secret);
            let inv = PairingInvite::parse(&link).unwrap();
            proptest::prop_assert_eq!(inv.testnet, testnet);
            proptest::prop_assert_eq!(inv.pubkey, key);
            proptest::prop_assert_eq!(inv.hub_host, host);
            proptest::prop_assert_eq!(inv.pairing_secret, Some(secret));
        }
    }

    #[test]
    fn test_payment_string() {
        let payments = json!({"payments": [{"address": "2QVJOY3BRRGWP7IOYL64O5BU3WLUJ4TZ", "amount": 1000000000u64, "asset": "base"}]});
        let encoded = generate_payment_string(&payments).unwrap();
        let decoded: Value = serde_json::from_slice(&B64.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, payments);
    }
}
