//! View-Modell für die Anruf-Ansicht

use crate::call_engine::{CallSnapshot, CallStatus};
use std::time::Duration;

pub const WAITING_FOR_PARTICIPANT: &str = "Waiting for participant...";

/// Sprach- oder Video-Ansicht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterVariant {
    Voice,
    Video,
}

impl PresenterVariant {
    pub fn has_video_controls(self) -> bool {
        self == PresenterVariant::Video
    }
}

/// Was die Ansicht gerade anzeigt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallView {
    pub variant: PresenterVariant,
    pub remote: String,
    pub status: CallStatus,
    pub status_label: &'static str,
    /// `mm:ss`, nur solange verbunden
    pub duration: Option<String>,
    pub error: Option<String>,
    pub notice: Option<String>,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub placeholder: Option<&'static str>,
    pub controls_enabled: bool,
    pub can_close: bool,
}

impl CallView {
    pub fn render(snapshot: &CallSnapshot, variant: PresenterVariant) -> Self {
        let connected = snapshot.status == CallStatus::Connected;
        let waiting = variant == PresenterVariant::Video
            && !snapshot.has_remote_video
            && !snapshot.status.is_terminal();

        Self {
            variant,
            remote: snapshot.remote.to_string(),
            status: snapshot.status,
            status_label: status_label(snapshot.status),
            duration: snapshot.duration().map(format_duration),
            error: snapshot.error.as_ref().map(|e| e.user_message()),
            notice: snapshot.notice.as_ref().map(|e| e.user_message()),
            muted: snapshot.muted,
            video_enabled: snapshot.video_enabled,
            screen_sharing: snapshot.screen_sharing,
            placeholder: waiting.then_some(WAITING_FOR_PARTICIPANT),
            controls_enabled: connected,
            // Jeder Zustand lässt sich schließen
            can_close: true,
        }
    }

    /// Kopfzeile der Sprach-Ansicht: Dauer wenn verbunden, sonst Status
    pub fn headline(&self) -> String {
        match &self.duration {
            Some(duration) => duration.clone(),
            None => self.status_label.to_string(),
        }
    }
}

pub fn status_label(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Idle | CallStatus::AcquiringMedia | CallStatus::Negotiating => "Connecting...",
        CallStatus::Connected => "Connected",
        CallStatus::Ended => "Call ended",
        CallStatus::Failed => "Call failed",
    }
}

/// Formatiert eine Dauer als `mm:ss`
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// TESTS
// ============================================================================
