//! Signaling Module - Kommunikation über den Relay
//!
//! Dieses Modul verwaltet:
//! - Wire-Format der Envelopes (call-start, offer, answer, ice-candidate, call-end)
//! - Session-bezogenes Senden und Filtern
//! - WebSocket-Verbindung zum Relay

mod adapter;
mod client;
mod messages;

pub use adapter::{SignalingAdapter, SignalingChannel};
pub use client::{relay_ws_url, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
