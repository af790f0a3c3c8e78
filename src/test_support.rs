//! Test-Doubles für Geräte, Peer Connections und den Relay

use crate::call_engine::{
    CallContext, CallCoordinator, CallMode, CallSettings, ConversationId, ParticipantId,
    SessionId,
};
use crate::directory::{ConversationDirectory, NewParticipant};
use crate::media::{
    CaptureProfile, LocalTrack, MediaDevices, MediaError, MediaTrackSet, TrackSource,
    LOCAL_STREAM_ID,
};
use crate::peer::{
    CandidateDescriptor, PeerConnectionManager, PeerEngine, PeerEngineFactory, PeerError,
    PeerEvent, PeerEventSink, SdpKind,
};
use crate::signaling::{
    Signal, SignalPayload, SignalingChannel, SignalingEnvelope, SignalingError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Skriptbare Geräte
#[derive(Default)]
pub struct FakeDevices {
    acquire_error: Mutex<Option<MediaError>>,
    camera_error: Mutex<Option<MediaError>>,
    display_error: Mutex<Option<MediaError>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    issued: Mutex<Vec<LocalTrack>>,
    acquire_calls: Mutex<usize>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// `acquire` wartet, bis der Sender feuert (Berechtigungsdialog)
    pub fn gated() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let devices = Self::default();
        *devices.gate.lock() = Some(rx);
        (devices, tx)
    }

    pub fn deny_acquire(&self, error: MediaError) {
        *self.acquire_error.lock() = Some(error);
    }

    pub fn deny_camera(&self, error: MediaError) {
        *self.camera_error.lock() = Some(error);
    }

    pub fn deny_display(&self, error: MediaError) {
        *self.display_error.lock() = Some(error);
    }

    pub fn issued(&self) -> Vec<LocalTrack> {
        self.issued.lock().clone()
    }

    pub fn issued_from(&self, source: TrackSource) -> Vec<LocalTrack> {
        self.issued()
            .into_iter()
            .filter(|t| t.source() == source)
            .collect()
    }

    pub fn acquire_calls(&self) -> usize {
        *self.acquire_calls.lock()
    }

    fn issue(&self, source: TrackSource) -> LocalTrack {
        let track = LocalTrack::new(source, LOCAL_STREAM_ID);
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(
        &self,
        mode: CallMode,
        _profile: &CaptureProfile,
    ) -> Result<MediaTrackSet, MediaError> {
        *self.acquire_calls.lock() += 1;
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(error) = self.acquire_error.lock().clone() {
            return Err(error);
        }

        let audio = self.issue(TrackSource::Microphone);
        let video = mode.is_video().then(|| self.issue(TrackSource::Camera));
        Ok(MediaTrackSet::new(Some(audio), video))
    }

    async fn acquire_camera(&self, _profile: &CaptureProfile) -> Result<LocalTrack, MediaError> {
        if let Some(error) = self.camera_error.lock().clone() {
            return Err(error);
        }
        Ok(self.issue(TrackSource::Camera))
    }

    async fn acquire_display_capture(&self) -> Result<LocalTrack, MediaError> {
        if let Some(error) = self.display_error.lock().clone() {
            return Err(error);
        }
        Ok(self.issue(TrackSource::Display))
    }
}

// ============================================================================
// PEER ENGINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    ReplaceVideo(String),
    Close,
}

#[derive(Default)]
struct FactoryState {
    calls: Vec<EngineCall>,
    sinks: Vec<PeerEventSink>,
    fail_remote: bool,
}

/// Zeichnet alle Engine-Aufrufe auf
#[derive(Default)]
pub struct FakePeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.state.lock().sinks.len()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn replaced_video(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::ReplaceVideo(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Remote Descriptions werden als ungültig abgelehnt
    pub fn reject_remote_descriptions(&self) {
        self.state.lock().fail_remote = true;
    }

    /// Schickt ein Event über die zuletzt erzeugte Verbindung
    pub fn emit(&self, event: PeerEvent) {
        let sink = self.state.lock().sinks.last().cloned();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

#[async_trait]
impl PeerEngineFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_urls: &[String],
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerEngine>, PeerError> {
        self.state.lock().sinks.push(sink);
        Ok(Box::new(FakeEngine {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeEngine {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeEngine {
    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(EngineCall::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        self.record(EngineCall::CreateOffer);
        Ok("v=0 offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.record(EngineCall::CreateAnswer);
        Ok("v=0 answer".to_string())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        if self.state.lock().fail_remote {
            return Err(PeerError::Negotiation("invalid SDP".to_string()));
        }
        self.record(EngineCall::SetRemote(kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<(), PeerError> {
        self.record(EngineCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(EngineCall::ReplaceVideo(track.id().to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(EngineCall::Close);
        Ok(())
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Zeichnet gesendete Envelopes auf
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SignalingEnvelope>>,
    fail: Mutex<bool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent().into_iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent().iter().filter(|e| e.kind == kind).count()
    }
}

impl SignalingChannel for RecordingChannel {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        if *self.fail.lock() {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}

// ============================================================================
// FIXTURE
// ============================================================================

pub const LOCAL: &str = "U1";
pub const REMOTE: &str = "U2";
pub const CONVERSATION: ConversationId = ConversationId(1);

/// Koordinator mit Fakes; Konversation 1 hat U1 (lokal) und U2
pub struct Fixture {
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeerFactory>,
    pub channel: Arc<RecordingChannel>,
    pub ctx: CallContext,
    pub coordinator: CallCoordinator,
    pub remote_session: SessionId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_devices(FakeDevices::new())
    }

    pub fn with_devices(devices: FakeDevices) -> Self {
        Self::build(devices, CallSettings::default())
    }

    pub fn with_settings(settings: CallSettings) -> Self {
        Self::build(FakeDevices::new(), settings)
    }

    fn build(devices: FakeDevices, settings: CallSettings) -> Self {
        let directory = ConversationDirectory::open_in_memory().unwrap();
        directory.add_conversation(CONVERSATION, None).unwrap();
        for participant in [LOCAL, REMOTE] {
            directory
                .add_participant(
                    CONVERSATION,
                    NewParticipant {
                        participant_id: ParticipantId::new(participant),
                        display_name: None,
                    },
                )
                .unwrap();
        }

        let devices = Arc::new(devices);
        let peers = Arc::new(FakePeerFactory::new());
        let channel = Arc::new(RecordingChannel::new());
        let ctx = CallContext {
            devices: devices.clone(),
            peers: Arc::new(PeerConnectionManager::new(peers.clone(), Vec::new())),
            signaling: channel.clone(),
            settings,
            profile: CaptureProfile::default(),
        };
        let coordinator =
            CallCoordinator::new(ParticipantId::new(LOCAL), Arc::new(directory), ctx.clone());

        Self {
            devices,
            peers,
            channel,
            ctx,
            coordinator,
            remote_session: SessionId::new(),
        }
    }

    /// Envelope wie es vom Remote-Teilnehmer kommt
    pub fn from_remote(&self, payload: SignalPayload) {
        self.from_remote_session(self.remote_session, payload);
    }

    /// Envelope aus einem bestimmten Anrufversuch des Remote-Teilnehmers
    pub fn from_remote_session(&self, session: SessionId, payload: SignalPayload) {
        self.coordinator
            .handle_envelope(SignalingEnvelope::encode(&Signal {
                conversation_id: CONVERSATION,
                from: Some(ParticipantId::new(REMOTE)),
                target: ParticipantId::new(LOCAL),
                session_id: Some(session),
                payload,
            }));
    }
}

/// Wartet (mit echter Zeit) bis die Bedingung erfüllt ist
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
