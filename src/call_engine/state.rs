//! Call Session - Aggregat eines Anrufversuchs
//!
//! Ein `CallSession` beschreibt genau einen Anrufversuch zwischen zwei
//! Teilnehmern. Der Status bewegt sich nur vorwärts; `Ended` und `Failed`
//! sind absorbierend.

use super::error::CallError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Eindeutige ID eines Anrufversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ID einer Konversation (numerisch, wie auf dem Relay)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ID eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CALL MODE / ROLE / STATUS
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Voice,
    Video,
}

impl CallMode {
    pub fn is_video(self) -> bool {
        matches!(self, CallMode::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallMode::Voice => "voice",
            CallMode::Video => "video",
        }
    }
}

/// Seite des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Wir haben angerufen und schicken das Offer
    Caller,
    /// Wir wurden angerufen und beantworten das Offer
    Callee,
}

/// Status eines Anrufversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Idle,
    AcquiringMedia,
    Negotiating,
    Connected,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }

    /// Prüft ob der Übergang erlaubt ist
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;

        match (self, next) {
            (current, _) if current.is_terminal() => false,

            // Abbruch ist aus jedem nicht-terminalen Zustand möglich
            (_, Ended) => true,

            (Idle, AcquiringMedia) => true,
            (AcquiringMedia, Negotiating) => true,
            (AcquiringMedia, Failed) => true,
            (Negotiating, Connected) => true,
            (Negotiating, Failed) => true,
            (Connected, Failed) => true,

            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::AcquiringMedia => "acquiring-media",
            CallStatus::Negotiating => "negotiating",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grund für ein reguläres Ende
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Lokaler Benutzer hat aufgelegt
    LocalHangup,
    /// Gegenseite hat `call-end` geschickt
    RemoteHangup,
    /// Ansicht geschlossen / Handle verworfen
    Cancelled,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Aggregat eines Anrufversuchs
#[derive(Debug, Clone)]
pub struct CallSession {
    id: SessionId,
    conversation_id: ConversationId,
    local: ParticipantId,
    remote: ParticipantId,
    mode: CallMode,
    role: CallRole,
    status: CallStatus,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    connected_instant: Option<Instant>,
    ended_at: Option<DateTime<Utc>>,
    muted: bool,
    video_enabled: bool,
    screen_sharing: bool,
    end_reason: Option<EndReason>,
    failure: Option<CallError>,
}

impl CallSession {
    pub fn new(
        conversation_id: ConversationId,
        local: ParticipantId,
        remote: ParticipantId,
        mode: CallMode,
        role: CallRole,
    ) -> Self {
        Self {
            id: SessionId::new(),
            conversation_id,
            local,
            remote,
            mode,
            role,
            status: CallStatus::Idle,
            started_at: Utc::now(),
            connected_at: None,
            connected_instant: None,
            ended_at: None,
            muted: false,
            video_enabled: mode.is_video(),
            screen_sharing: false,
            end_reason: None,
            failure: None,
        }
    }

    /// Führt einen Statusübergang durch
    pub fn transition_to(&mut self, next: CallStatus) -> Result<(), CallError> {
        if !self.status.can_transition_to(next) {
            return Err(CallError::InvalidState(format!(
                "cannot transition from {} to {}",
                self.status, next
            )));
        }

        self.status = next;
        match next {
            CallStatus::Connected => {
                self.connected_at = Some(Utc::now());
                self.connected_instant = Some(Instant::now());
            }
            CallStatus::Ended | CallStatus::Failed => {
                self.ended_at = Some(Utc::now());
                self.screen_sharing = false;
            }
            _ => {}
        }
        Ok(())
    }

    /// Beendet den Anruf regulär
    pub fn end(&mut self, reason: EndReason) -> Result<(), CallError> {
        self.transition_to(CallStatus::Ended)?;
        self.end_reason = Some(reason);
        Ok(())
    }

    /// Beendet den Anruf mit Fehler
    pub fn fail(&mut self, error: CallError) -> Result<(), CallError> {
        self.transition_to(CallStatus::Failed)?;
        self.failure = Some(error);
        Ok(())
    }

    /// Schaltet Mute um und gibt den neuen Zustand zurück
    pub fn toggle_muted(&mut self) -> Result<bool, CallError> {
        self.require_connected("toggle mute")?;
        self.muted = !self.muted;
        Ok(self.muted)
    }

    /// Schaltet Video um (nur Videoanrufe)
    pub fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.require_connected("toggle video")?;
        if !self.mode.is_video() {
            return Err(CallError::InvalidState(
                "video toggle requires a video call".to_string(),
            ));
        }
        self.video_enabled = !self.video_enabled;
        Ok(self.video_enabled)
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        if self.mode.is_video() {
            self.video_enabled = enabled;
        }
    }

    /// Setzt den Screen-Share-Status
    ///
    /// `true` ist nur in einem verbundenen Videoanruf erlaubt.
    pub fn set_screen_sharing(&mut self, sharing: bool) -> Result<(), CallError> {
        if sharing {
            self.require_connected("screen share")?;
            if !self.mode.is_video() {
                return Err(CallError::InvalidState(
                    "screen share requires a video call".to_string(),
                ));
            }
        }
        self.screen_sharing = sharing;
        Ok(())
    }

    fn require_connected(&self, action: &str) -> Result<(), CallError> {
        if self.status != CallStatus::Connected {
            return Err(CallError::InvalidState(format!(
                "{} requires a connected call (status: {})",
                action, self.status
            )));
        }
        Ok(())
    }

    /// Gesprächsdauer seit dem Übergang zu `Connected`
    pub fn duration(&self) -> Option<Duration> {
        self.connected_instant.map(|since| since.elapsed())
    }

    // Getters
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn connected_instant(&self) -> Option<Instant> {
        self.connected_instant
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_sharing
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn failure(&self) -> Option<&CallError> {
        self.failure.as_ref()
    }
}

// ============================================================================
// TESTS
// ============================================================================
