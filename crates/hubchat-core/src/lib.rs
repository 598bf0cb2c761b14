//! hubchat core - device sessions over an untrusted store-and-forward hub.
//!
//! This crate implements:
//! - The hub channel seam and its event model
//! - The device protocol state machine (login, temp key publication,
//!   inbound dispatch, outbound delivery)
//! - The chat session layer (invites, pairing-triggered delivery)
//! - Device configuration and key loading
//! - In-process hubs for tests

#![forbid(unsafe_code)]

// Core state machines
pub mod device;
pub mod chat;

// Seams
pub mod hub;

// Supporting modules
pub mod config;
pub mod errors;
pub mod types;
pub mod keys;
pub mod harness;

pub use chat::ChatSession;
pub use config::DeviceConfig;
pub use device::{DeviceProtocol, DeviceState};
pub use errors::CoreError;
pub use hub::{HubChannel, HubEvent};
pub use types::{DeviceEvent, IncomingMessage};
