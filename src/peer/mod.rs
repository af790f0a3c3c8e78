//! Peer Module - WebRTC Peer Connections
//!
//! - Offer/Answer in der richtigen Reihenfolge
//! - Pufferung von Remote ICE Candidates
//! - Austausch des Video-Senders für Screen Share

mod candidate;
mod connection;
mod engine;

pub use candidate::{default_stun_urls, ice_servers, CandidateDescriptor, DEFAULT_STUN_URLS};
pub use connection::{NegotiationState, PeerConnectionHandle, PeerConnectionManager};
pub use engine::{
    PeerConnectionState, PeerEngine, PeerEngineFactory, PeerError, PeerEvent, PeerEventSink,
    SdpKind, WebRtcEngine, WebRtcEngineFactory,
};
