//! Handle auf eine laufende Call-Session

use super::error::CallError;
use super::machine::CallInput;
use super::state::{CallMode, CallRole, CallSession, CallStatus, ConversationId, EndReason, ParticipantId, SessionId};
use crate::media::MediaTrackSet;
use crate::signaling::Signal;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Benutzeraktionen auf einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    ToggleMute,
    ToggleVideo,
    StartScreenShare,
    StopScreenShare,
    EndCall,
    /// Ansicht geschlossen, sofortiger Abbau
    Close,
}

/// Veröffentlichter Zustand einer Session
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub remote: ParticipantId,
    pub mode: CallMode,
    pub role: CallRole,
    pub status: CallStatus,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub has_local_audio: bool,
    pub has_local_video: bool,
    pub has_remote_audio: bool,
    pub has_remote_video: bool,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub connected_instant: Option<Instant>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub error: Option<CallError>,
    /// Nicht-fataler Fehler (z.B. Screen Share abgelehnt)
    pub notice: Option<CallError>,
}

impl CallSnapshot {
    pub(crate) fn capture(
        session: &CallSession,
        tracks: Option<&MediaTrackSet>,
        notice: Option<CallError>,
    ) -> Self {
        Self {
            session_id: session.id(),
            conversation_id: session.conversation_id(),
            remote: session.remote().clone(),
            mode: session.mode(),
            role: session.role(),
            status: session.status(),
            muted: session.is_muted(),
            video_enabled: session.is_video_enabled(),
            screen_sharing: session.is_screen_sharing(),
            has_local_audio: tracks.map_or(false, |t| t.audio().is_some()),
            has_local_video: tracks.map_or(false, |t| t.video().is_some()),
            has_remote_audio: tracks.map_or(false, |t| t.has_remote_audio()),
            has_remote_video: tracks.map_or(false, |t| t.has_remote_video()),
            started_at: session.started_at(),
            connected_at: session.connected_at(),
            connected_instant: session.connected_instant(),
            ended_at: session.ended_at(),
            end_reason: session.end_reason(),
            error: session.failure().cloned(),
            notice,
        }
    }

    /// Gesprächsdauer, solange verbunden
    pub fn duration(&self) -> Option<Duration> {
        if self.status != CallStatus::Connected {
            return None;
        }
        self.connected_instant.map(|since| since.elapsed())
    }
}

/// Handle auf eine Call-Session
///
/// Alle Aktionen werden in die Queue der Session gestellt und dort
/// nacheinander abgearbeitet.
#[derive(Clone)]
pub struct CallHandle {
    session_id: SessionId,
    conversation_id: ConversationId,
    mode: CallMode,
    remote_session: Option<SessionId>,
    tx: mpsc::UnboundedSender<CallInput>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub(crate) fn new(
        session_id: SessionId,
        conversation_id: ConversationId,
        mode: CallMode,
        tx: mpsc::UnboundedSender<CallInput>,
        snapshot: watch::Receiver<CallSnapshot>,
    ) -> Self {
        Self {
            session_id,
            conversation_id,
            mode,
            remote_session: None,
            tx,
            snapshot,
        }
    }

    /// Bindet das Handle an die Session-ID des Anrufers
    pub(crate) fn bound_to(mut self, remote_session: Option<SessionId>) -> Self {
        self.remote_session = remote_session;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    /// Session-ID des eingehenden Anrufs, den diese Session beantwortet
    pub fn remote_session(&self) -> Option<SessionId> {
        self.remote_session
    }

    pub fn toggle_mute(&self) -> Result<(), CallError> {
        self.command(CallCommand::ToggleMute)
    }

    pub fn toggle_video(&self) -> Result<(), CallError> {
        self.command(CallCommand::ToggleVideo)
    }

    pub fn start_screen_share(&self) -> Result<(), CallError> {
        self.command(CallCommand::StartScreenShare)
    }

    pub fn stop_screen_share(&self) -> Result<(), CallError> {
        self.command(CallCommand::StopScreenShare)
    }

    pub fn end_call(&self) -> Result<(), CallError> {
        self.command(CallCommand::EndCall)
    }

    /// Bricht die Session sofort ab
    pub fn close(&self) -> Result<(), CallError> {
        self.command(CallCommand::Close)
    }

    pub fn command(&self, command: CallCommand) -> Result<(), CallError> {
        self.tx
            .send(CallInput::Command(command))
            .map_err(|_| CallError::SessionClosed)
    }

    /// Aktueller Zustand
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.snapshot.borrow().status.is_terminal()
    }

    /// Wartet bis der Zustand die Bedingung erfüllt
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, CallError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| CallError::SessionClosed)?
            .clone();
        Ok(snapshot)
    }

    pub(crate) fn deliver(&self, signal: Signal) -> bool {
        self.tx.send(CallInput::Signal(signal)).is_ok()
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("session_id", &self.session_id)
            .field("conversation_id", &self.conversation_id)
            .field("status", &self.snapshot.borrow().status)
            .finish()
    }
}
