//! The hub channel seam.
//!
//! A device talks to its hub over one duplex connection. Inbound traffic is
//! a sequence of [`HubEvent`]s drained by a single task; outbound traffic is
//! either a fire-and-forget notification or a request awaiting a response.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::HubError;

/// Hub command and subject names.
pub mod subjects {
    pub const CHALLENGE: &str = "hub/challenge";
    pub const LOGIN: &str = "hub/login";
    pub const TEMP_PUBKEY: &str = "hub/temp_pubkey";
    pub const REFRESH: &str = "hub/refresh";
    pub const REPEAT_CHALLENGE: &str = "hub/repeat_challenge";
    pub const MESSAGE: &str = "hub/message";
    pub const DELETE: &str = "hub/delete";
    pub const GET_TEMP_PUBKEY: &str = "hub/get_temp_pubkey";
    pub const DELIVER: &str = "hub/deliver";
}

/// Events delivered by the hub connection.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// The transport (re)connected; any previous login is void.
    Connected,
    /// An unsolicited notification from the hub.
    Justsaying { subject: String, body: Value },
}

impl HubEvent {
    pub fn justsaying(subject: &str, body: Value) -> Self {
        HubEvent::Justsaying { subject: subject.to_string(), body }
    }
}

#[async_trait]
pub trait HubChannel: Send + Sync {
    /// Fire-and-forget notification. Must not block on the network.
    fn notify(&self, subject: &str, body: Value) -> Result<(), HubError>;

    /// Issue a request whose response is not awaited.
    fn post(&self, command: &str, params: Value) -> Result<(), HubError>;

    /// Issue a request and wait for the hub's response.
    async fn request(&self, command: &str, params: Value) -> Result<Value, HubError>;
}

#[async_trait]
impl<T: HubChannel + ?Sized> HubChannel for std::sync::Arc<T> {
    fn notify(&self, subject: &str, body: Value) -> Result<(), HubError> {
        (**self).notify(subject, body)
    }

    fn post(&self, command: &str, params: Value) -> Result<(), HubError> {
        (**self).post(command, params)
    }

    async fn request(&self, command: &str, params: Value) -> Result<Value, HubError> {
        (**self).request(command, params).await
    }
}
