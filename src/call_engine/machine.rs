//! Call Session State Machine
//!
//! Jede Session läuft als eigener Task und verarbeitet ihre Eingaben
//! (Benutzeraktionen, Signale, Geräte-Ergebnisse, Peer-Events, Timer)
//! strikt nacheinander aus einer Queue. Der Abbau läuft genau einmal.

use super::coordinator::SessionRegistry;
use super::error::CallError;
use super::handle::{CallCommand, CallHandle, CallSnapshot};
use super::state::{CallRole, CallSession, CallStatus, EndReason};
use crate::media::{
    CaptureProfile, LocalTrack, MediaDevices, MediaError, MediaTrackSet, TrackKind, TrackState,
};
use crate::peer::{
    CandidateDescriptor, PeerConnectionHandle, PeerConnectionManager, PeerConnectionState,
    PeerError, PeerEvent, PeerEventSink,
};
use crate::signaling::{Signal, SignalPayload, SignalingAdapter, SignalingChannel};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// SETTINGS
// ============================================================================

/// Wie lange `disconnected` dauern darf, bevor der Anruf scheitert
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(10);

/// Maximale Dauer von `negotiating`
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSettings {
    pub disconnect_grace: Duration,
    pub negotiation_timeout: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

/// Gemeinsame Abhängigkeiten aller Sessions
#[derive(Clone)]
pub struct CallContext {
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<PeerConnectionManager>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub settings: CallSettings,
    pub profile: CaptureProfile,
}

// ============================================================================
// INPUTS
// ============================================================================

pub(crate) enum CallInput {
    Command(CallCommand),
    Signal(Signal),
    MediaAcquired(Result<MediaTrackSet, MediaError>),
    DisplayAcquired(Result<LocalTrack, MediaError>),
    CameraAcquired(Result<LocalTrack, MediaError>),
    Peer(PeerEvent),
    ShareTrackEnded(String),
    DisconnectGraceExpired(u64),
    NegotiationTimedOut,
}

impl CallInput {
    /// Gibt Geräte frei, die nicht mehr zugestellt werden können
    fn discard(self) {
        match self {
            CallInput::MediaAcquired(Ok(mut tracks)) => {
                tracks.release();
            }
            CallInput::DisplayAcquired(Ok(track)) | CallInput::CameraAcquired(Ok(track)) => {
                track.stop();
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScreenShare {
    Idle,
    Starting,
    Active(String),
    Stopping,
}

enum Outcome {
    Ended(EndReason),
    Failed(CallError),
}

// ============================================================================
// STATE MACHINE
// ============================================================================

pub struct CallSessionMachine {
    session: CallSession,
    ctx: CallContext,
    signaling: SignalingAdapter,
    tracks: Option<MediaTrackSet>,
    peer: Option<PeerConnectionHandle>,
    inbox: mpsc::UnboundedReceiver<CallInput>,
    sender: mpsc::WeakUnboundedSender<CallInput>,
    snapshot: watch::Sender<CallSnapshot>,
    registry: Option<SessionRegistry>,
    pending_offer: Option<String>,
    early_candidates: Vec<CandidateDescriptor>,
    share: ScreenShare,
    peer_state: PeerConnectionState,
    disconnect_generation: u64,
    announced: bool,
    torn_down: bool,
    notice: Option<CallError>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallSessionMachine {
    /// Erstellt Maschine und Handle; gestartet wird mit `run`
    pub fn new(
        session: CallSession,
        ctx: CallContext,
        registry: Option<SessionRegistry>,
    ) -> (CallHandle, Self) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let signaling = SignalingAdapter::new(
            Arc::clone(&ctx.signaling),
            session.conversation_id(),
            session.local().clone(),
            session.remote().clone(),
            session.id(),
        );
        let (snapshot, snapshot_rx) = watch::channel(CallSnapshot::capture(&session, None, None));
        let handle = CallHandle::new(
            session.id(),
            session.conversation_id(),
            session.mode(),
            tx.clone(),
            snapshot_rx,
        );

        let machine = Self {
            announced: session.role() == CallRole::Callee,
            session,
            ctx,
            signaling,
            tracks: None,
            peer: None,
            inbox,
            sender: tx.downgrade(),
            snapshot,
            registry,
            pending_offer: None,
            early_candidates: Vec::new(),
            share: ScreenShare::Idle,
            peer_state: PeerConnectionState::New,
            disconnect_generation: 0,
            torn_down: false,
            notice: None,
            tasks: Vec::new(),
        };
        (handle, machine)
    }

    /// Verarbeitet Eingaben bis zum Abbau
    pub async fn run(mut self) {
        tracing::info!(
            session = %self.session.id(),
            "Starting {} call with {} as {:?}",
            self.session.mode().as_str(),
            self.session.remote(),
            self.session.role()
        );

        self.begin_acquire();
        self.publish();

        while !self.torn_down {
            let Some(input) = self.inbox.recv().await else {
                tracing::info!(session = %self.session.id(), "All call handles dropped");
                self.finish(Outcome::Ended(EndReason::Cancelled)).await;
                self.publish();
                break;
            };
            self.handle(input).await;
            self.publish();
        }

        // Späte Geräte-Zusagen freigeben
        self.inbox.close();
        while let Ok(input) = self.inbox.try_recv() {
            input.discard();
        }

        if let Some(registry) = &self.registry {
            registry.remove(self.session.conversation_id(), self.session.id());
        }

        tracing::info!(
            session = %self.session.id(),
            "Call session finished: {}",
            self.session.status()
        );
    }

    async fn handle(&mut self, input: CallInput) {
        match input {
            CallInput::Command(command) => self.on_command(command).await,
            CallInput::Signal(signal) => self.on_signal(signal).await,
            CallInput::MediaAcquired(result) => self.on_media_acquired(result).await,
            CallInput::DisplayAcquired(result) => self.on_display_acquired(result).await,
            CallInput::CameraAcquired(result) => self.on_camera_acquired(result).await,
            CallInput::Peer(event) => self.on_peer_event(event).await,
            CallInput::ShareTrackEnded(track_id) => self.on_share_track_ended(&track_id),
            CallInput::DisconnectGraceExpired(generation) => {
                if generation == self.disconnect_generation
                    && self.peer_state == PeerConnectionState::Disconnected
                {
                    self.finish(Outcome::Failed(CallError::ConnectionFailed(
                        "connection did not recover from disconnect".to_string(),
                    )))
                    .await;
                }
            }
            CallInput::NegotiationTimedOut => {
                if self.session.status() == CallStatus::Negotiating {
                    self.finish(Outcome::Failed(CallError::ConnectionFailed(
                        "negotiation timed out".to_string(),
                    )))
                    .await;
                }
            }
        }
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    fn begin_acquire(&mut self) {
        if let Err(e) = self.session.transition_to(CallStatus::AcquiringMedia) {
            tracing::warn!("Cannot acquire media: {}", e);
            return;
        }
        let Some(tx) = self.sender.upgrade() else {
            return;
        };

        let devices = Arc::clone(&self.ctx.devices);
        let profile = self.ctx.profile.clone();
        let mode = self.session.mode();

        // Nicht abbrechbar: eine späte Zusage wird beim Zustellen freigegeben
        tokio::spawn(async move {
            let result = devices.acquire(mode, &profile).await;
            if let Err(rejected) = tx.send(CallInput::MediaAcquired(result)) {
                rejected.0.discard();
            }
        });
    }

    async fn on_media_acquired(&mut self, result: Result<MediaTrackSet, MediaError>) {
        let mut tracks = match result {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::warn!(session = %self.session.id(), "Media acquisition failed: {}", e);
                return self.finish(Outcome::Failed(e.into())).await;
            }
        };

        if self.session.status() != CallStatus::AcquiringMedia {
            tracks.release();
            return;
        }
        if let Err(e) = self.session.transition_to(CallStatus::Negotiating) {
            tracing::warn!("Cannot start negotiation: {}", e);
            tracks.release();
            return;
        }
        self.arm_negotiation_timeout();

        let created = self
            .ctx
            .peers
            .create(&tracks, self.session.remote(), self.peer_sink())
            .await;
        self.tracks = Some(tracks);

        let mut peer = match created {
            Ok(peer) => peer,
            Err(e) => return self.finish(Outcome::Failed(e.into())).await,
        };

        for candidate in std::mem::take(&mut self.early_candidates) {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                tracing::warn!("Failed to queue early ICE candidate: {}", e);
            }
        }
        self.peer = Some(peer);

        match self.session.role() {
            CallRole::Caller => self.send_offer().await,
            CallRole::Callee => {
                if let Some(sdp) = self.pending_offer.take() {
                    self.answer_offer(sdp).await;
                }
            }
        }
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    async fn send_offer(&mut self) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };

        match peer.create_offer().await {
            Ok(sdp) => {
                self.signaling.send_call_start(self.session.mode());
                self.announced = true;
                self.signaling.send_offer(sdp);
            }
            Err(e) => self.finish(Outcome::Failed(e.into())).await,
        }
    }

    async fn answer_offer(&mut self, sdp: String) {
        let Some(peer) = self.peer.as_mut() else {
            self.pending_offer = Some(sdp);
            return;
        };

        match peer.apply_remote_offer(sdp).await {
            Ok(answer) => self.signaling.send_answer(answer),
            Err(e) => self.finish(Outcome::Failed(e.into())).await,
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        if !self.signaling.accept(&signal) {
            return;
        }

        match signal.payload {
            SignalPayload::CallEnd { .. } => {
                tracing::info!(session = %self.session.id(), "Remote participant ended the call");
                self.finish(Outcome::Ended(EndReason::RemoteHangup)).await;
            }
            SignalPayload::CallStart { .. } => {
                tracing::debug!("Ignoring call-start for a running session");
            }
            SignalPayload::Offer { sdp } => self.on_remote_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.on_remote_answer(sdp).await,
            SignalPayload::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
        }
    }

    async fn on_remote_offer(&mut self, sdp: String) {
        let status = self.session.status();
        if status == CallStatus::Connected {
            tracing::warn!("Ignoring offer on a connected call");
            return;
        }
        if self.session.role() == CallRole::Caller {
            return self
                .finish(Outcome::Failed(CallError::Negotiation(
                    "received an offer while placing a call".to_string(),
                )))
                .await;
        }

        match status {
            CallStatus::Idle | CallStatus::AcquiringMedia if self.pending_offer.is_none() => {
                tracing::debug!("Holding remote offer until local media is ready");
                self.pending_offer = Some(sdp);
            }
            CallStatus::Negotiating if self.peer.is_some() => self.answer_offer(sdp).await,
            _ => {
                self.finish(Outcome::Failed(CallError::Negotiation(
                    "duplicate offer".to_string(),
                )))
                .await
            }
        }
    }

    async fn on_remote_answer(&mut self, sdp: String) {
        let status = self.session.status();
        if status == CallStatus::Connected {
            tracing::warn!("Ignoring answer on a connected call");
            return;
        }
        if self.session.role() == CallRole::Callee || status != CallStatus::Negotiating {
            return self
                .finish(Outcome::Failed(CallError::Negotiation(format!(
                    "unexpected answer in status {}",
                    status
                ))))
                .await;
        }

        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        match peer.apply_remote_answer(sdp).await {
            Ok(()) => tracing::debug!(session = %self.session.id(), "Applied remote answer"),
            Err(e) => self.finish(Outcome::Failed(e.into())).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: CandidateDescriptor) {
        match self.peer.as_mut() {
            Some(peer) => {
                if let Err(e) = peer.add_remote_candidate(candidate).await {
                    tracing::warn!("Failed to apply remote ICE candidate: {}", e);
                }
            }
            None => {
                tracing::debug!("Holding remote ICE candidate until the peer connection exists");
                self.early_candidates.push(candidate);
            }
        }
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    fn peer_sink(&self) -> PeerEventSink {
        let sender = self.sender.clone();
        Arc::new(move |event: PeerEvent| {
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(CallInput::Peer(event));
            }
        })
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => match self.session.status() {
                CallStatus::Negotiating | CallStatus::Connected => {
                    self.signaling.send_candidate(candidate)
                }
                status => tracing::debug!("Dropping local ICE candidate in status {}", status),
            },
            PeerEvent::RemoteTrack(track) => {
                if let Some(tracks) = self.tracks.as_mut() {
                    tracks.add_remote(track);
                }
            }
            PeerEvent::StateChanged(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: PeerConnectionState) {
        let previous = std::mem::replace(&mut self.peer_state, state);

        match state {
            PeerConnectionState::Connected => {
                // Laufende Grace-Timer entwerten
                self.disconnect_generation += 1;
                match self.session.status() {
                    CallStatus::Negotiating => match self.session.transition_to(CallStatus::Connected) {
                        Ok(()) => tracing::info!(session = %self.session.id(), "Call connected"),
                        Err(e) => tracing::warn!("Cannot mark call connected: {}", e),
                    },
                    CallStatus::Connected if previous == PeerConnectionState::Disconnected => {
                        tracing::info!(session = %self.session.id(), "Connection recovered")
                    }
                    _ => {}
                }
            }
            PeerConnectionState::Disconnected => {
                if matches!(
                    self.session.status(),
                    CallStatus::Negotiating | CallStatus::Connected
                ) {
                    self.arm_disconnect_grace();
                }
            }
            PeerConnectionState::Failed => {
                self.finish(Outcome::Failed(CallError::ConnectionFailed(
                    "ICE/DTLS connection failed".to_string(),
                )))
                .await
            }
            PeerConnectionState::Closed => {
                self.finish(Outcome::Failed(CallError::ConnectionFailed(
                    "peer connection closed unexpectedly".to_string(),
                )))
                .await
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {
                tracing::debug!("Peer connection state: {:?}", state)
            }
        }
    }

    // ========================================================================
    // CONTROLS
    // ========================================================================

    async fn on_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::ToggleMute => match self.session.toggle_muted() {
                Ok(muted) => {
                    if let Some(tracks) = &self.tracks {
                        tracks.set_track_enabled(TrackKind::Audio, !muted);
                    }
                    tracing::info!(session = %self.session.id(), "Muted: {}", muted);
                }
                Err(e) => tracing::debug!("Ignoring toggle mute: {}", e),
            },
            CallCommand::ToggleVideo => match self.session.toggle_video() {
                Ok(enabled) => {
                    if let Some(tracks) = &self.tracks {
                        tracks.set_track_enabled(TrackKind::Video, enabled);
                    }
                    tracing::info!(session = %self.session.id(), "Video enabled: {}", enabled);
                }
                Err(e) => tracing::debug!("Ignoring toggle video: {}", e),
            },
            CallCommand::StartScreenShare => self.start_screen_share(),
            CallCommand::StopScreenShare => {
                if matches!(self.share, ScreenShare::Active(_)) {
                    self.begin_camera_restore();
                } else {
                    tracing::debug!("Ignoring stop screen share: not sharing");
                }
            }
            CallCommand::EndCall => self.finish(Outcome::Ended(EndReason::LocalHangup)).await,
            CallCommand::Close => self.finish(Outcome::Ended(EndReason::Cancelled)).await,
        }
    }

    fn start_screen_share(&mut self) {
        if self.session.status() != CallStatus::Connected || !self.session.mode().is_video() {
            tracing::debug!("Ignoring screen share outside a connected video call");
            return;
        }
        if self.share != ScreenShare::Idle {
            tracing::debug!("Ignoring screen share: already {:?}", self.share);
            return;
        }
        let Some(tx) = self.sender.upgrade() else {
            return;
        };

        self.share = ScreenShare::Starting;
        let devices = Arc::clone(&self.ctx.devices);
        tokio::spawn(async move {
            let result = devices.acquire_display_capture().await;
            if let Err(rejected) = tx.send(CallInput::DisplayAcquired(result)) {
                rejected.0.discard();
            }
        });
    }

    async fn on_display_acquired(&mut self, result: Result<LocalTrack, MediaError>) {
        if self.share != ScreenShare::Starting || self.session.status() != CallStatus::Connected {
            if let Ok(track) = result {
                track.stop();
            }
            return;
        }

        let display = match result {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Screen share was not started: {}", e);
                self.share = ScreenShare::Idle;
                self.notice = Some(CallError::ScreenShare(e.to_string()));
                return;
            }
        };

        if let Err(e) = self.replace_outgoing_video(&display).await {
            tracing::warn!("Failed to send screen share: {}", e);
            display.stop();
            self.share = ScreenShare::Idle;
            self.notice = Some(CallError::ScreenShare(e.to_string()));
            return;
        }

        if let Some(tracks) = self.tracks.as_mut() {
            tracks.replace_video(display.clone());
        }
        self.session.set_video_enabled(true);
        if let Err(e) = self.session.set_screen_sharing(true) {
            tracing::warn!("Cannot mark screen sharing: {}", e);
        }
        self.share = ScreenShare::Active(display.id().to_string());
        self.notice = None;
        tracing::info!(session = %self.session.id(), "Screen sharing started");

        // Ende durch das System ("Freigabe beenden") beobachten
        let sender = self.sender.clone();
        self.spawn_tracked(async move {
            if display.finished().await == TrackState::Ended {
                if let Some(tx) = sender.upgrade() {
                    let _ = tx.send(CallInput::ShareTrackEnded(display.id().to_string()));
                }
            }
        });
    }

    fn on_share_track_ended(&mut self, track_id: &str) {
        if self.share == ScreenShare::Active(track_id.to_string()) {
            tracing::info!(session = %self.session.id(), "Screen share ended by the system");
            self.begin_camera_restore();
        }
    }

    fn begin_camera_restore(&mut self) {
        let Some(tx) = self.sender.upgrade() else {
            return;
        };

        self.share = ScreenShare::Stopping;
        let devices = Arc::clone(&self.ctx.devices);
        let profile = self.ctx.profile.clone();
        tokio::spawn(async move {
            let result = devices.acquire_camera(&profile).await;
            if let Err(rejected) = tx.send(CallInput::CameraAcquired(result)) {
                rejected.0.discard();
            }
        });
    }

    async fn on_camera_acquired(&mut self, result: Result<LocalTrack, MediaError>) {
        if self.share != ScreenShare::Stopping || self.session.status() != CallStatus::Connected {
            if let Ok(track) = result {
                track.stop();
            }
            return;
        }

        let camera = match result {
            Ok(track) => track,
            Err(e) => return self.camera_restore_failed(e.to_string()),
        };

        if let Err(e) = self.replace_outgoing_video(&camera).await {
            camera.stop();
            return self.camera_restore_failed(e.to_string());
        }

        camera.set_enabled(self.session.is_video_enabled());
        if let Some(tracks) = self.tracks.as_mut() {
            tracks.replace_video(camera);
        }
        if let Err(e) = self.session.set_screen_sharing(false) {
            tracing::warn!("Cannot clear screen sharing: {}", e);
        }
        self.share = ScreenShare::Idle;
        tracing::info!(session = %self.session.id(), "Screen sharing stopped, camera restored");
    }

    fn camera_restore_failed(&mut self, reason: String) {
        tracing::warn!("Failed to restore camera after screen share: {}", reason);
        self.notice = Some(CallError::ScreenShare(format!("camera unavailable: {}", reason)));

        let display = self.tracks.as_ref().and_then(|t| t.video()).cloned();
        match display {
            Some(display) if display.is_live() => {
                self.share = ScreenShare::Active(display.id().to_string());
            }
            other => {
                // Kein sendbarer Video-Track mehr
                if let Some(track) = other {
                    track.stop();
                }
                self.share = ScreenShare::Idle;
                let _ = self.session.set_screen_sharing(false);
                self.session.set_video_enabled(false);
            }
        }
    }

    async fn replace_outgoing_video(&self, track: &LocalTrack) -> Result<(), PeerError> {
        match self.peer.as_ref() {
            Some(peer) => peer.replace_video_track(track).await,
            None => Err(PeerError::Closed),
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    fn arm_negotiation_timeout(&mut self) {
        let timeout = self.ctx.settings.negotiation_timeout;
        let sender = self.sender.clone();
        self.spawn_tracked(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(CallInput::NegotiationTimedOut);
            }
        });
    }

    fn arm_disconnect_grace(&mut self) {
        self.disconnect_generation += 1;
        let generation = self.disconnect_generation;
        let grace = self.ctx.settings.disconnect_grace;
        tracing::warn!(
            session = %self.session.id(),
            "Peer connection disconnected, waiting {:?} for recovery",
            grace
        );

        let sender = self.sender.clone();
        self.spawn_tracked(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(CallInput::DisconnectGraceExpired(generation));
            }
        });
    }

    fn spawn_tracked<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    async fn finish(&mut self, outcome: Outcome) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let notify_remote = match outcome {
            Outcome::Ended(reason) => {
                tracing::info!(session = %self.session.id(), "Call ended: {:?}", reason);
                if let Err(e) = self.session.end(reason) {
                    tracing::warn!("Unexpected end transition: {}", e);
                }
                reason != EndReason::RemoteHangup
            }
            Outcome::Failed(error) => {
                tracing::error!(session = %self.session.id(), "Call failed: {}", error);
                if let Err(e) = self.session.fail(error) {
                    tracing::warn!("Unexpected failure transition: {}", e);
                }
                true
            }
        };

        if notify_remote && self.announced {
            self.signaling.send_call_end(self.session.mode());
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut tracks) = self.tracks.take() {
            tracks.release();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
        self.pending_offer = None;
        self.early_candidates.clear();
        self.share = ScreenShare::Idle;
    }

    fn publish(&self) {
        self.snapshot.send_replace(CallSnapshot::capture(
            &self.session,
            self.tracks.as_ref(),
            self.notice.clone(),
        ));
    }
}

// ============================================================================
// TESTS
// ============================================================================
