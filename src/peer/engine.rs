//! WebRTC Engine
//!
//! Dünne Schicht über `RTCPeerConnection`. Die Reihenfolge der
//! Verhandlungsschritte prüft `PeerConnectionHandle`, nicht die Engine.

use super::candidate::{ice_servers, CandidateDescriptor};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRTC(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            _ => PeerConnectionState::New,
        }
    }
}

/// Events der Peer Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged(PeerConnectionState),
    LocalCandidate(CandidateDescriptor),
    RemoteTrack(RemoteTrack),
}

/// Empfänger für Peer-Events
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

// ============================================================================
// ENGINE TRAITS
// ============================================================================

/// Eine einzelne Peer Connection
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<(), PeerError>;

    /// Tauscht die Quelle des Video-Senders ohne Neuverhandlung
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt Peer Connections
#[async_trait]
pub trait PeerEngineFactory: Send + Sync {
    async fn create(
        &self,
        ice_urls: &[String],
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerEngine>, PeerError>;
}

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

/// Factory für echte webrtc-rs Peer Connections
#[derive(Debug, Default)]
pub struct WebRtcEngineFactory;

impl WebRtcEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerEngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        ice_urls: &[String],
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerEngine>, PeerError> {
        let engine = WebRtcEngine::connect(ice_urls, sink).await?;
        Ok(Box::new(engine))
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl WebRtcEngine {
    /// Erstellt eine neue Peer Connection
    pub async fn connect(ice_urls: &[String], sink: PeerEventSink) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers(ice_urls),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?,
        );

        Self::register_handlers(&pc, sink);

        Ok(Self {
            pc,
            video_sender: Mutex::new(None),
        })
    }

    fn register_handlers(pc: &RTCPeerConnection, sink: PeerEventSink) {
        let state_sink = Arc::clone(&sink);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            state_sink(PeerEvent::StateChanged(s.into()));
            Box::pin(async {})
        }));

        let candidate_sink = Arc::clone(&sink);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidate_sink(PeerEvent::LocalCandidate(init.into())),
                    Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let track_sink = sink;
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Received remote {:?} track: {}", kind, track.id());
            track_sink(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
            }));
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(track.rtp_track())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(sender);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| PeerError::Negotiation(format!("invalid SDP: {}", e)))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| PeerError::Negotiation("no video sender to replace".to_string()))?;

        sender
            .replace_track(Some(track.rtp_track()))
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.video_sender.lock().take();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }
}
