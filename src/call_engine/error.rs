//! Fehlertypen der Call-Session

use super::state::ConversationId;
use crate::media::MediaError;
use crate::peer::PeerError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No call target for conversation {0}")]
    NoTarget(ConversationId),

    #[error("A call is already active for conversation {0}")]
    SessionActive(ConversationId),

    #[error("Call session is closed")]
    SessionClosed,

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Screen sharing failed: {0}")]
    ScreenShare(String),

    #[error("Participant lookup failed: {0}")]
    Directory(String),
}

impl CallError {
    /// Fehler die den Anruf nicht beenden
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CallError::ScreenShare(_) | CallError::InvalidState(_))
    }

    /// Meldung für die Anzeige
    pub fn user_message(&self) -> String {
        match self {
            CallError::PermissionDenied(_) => {
                "Failed to start call: microphone or camera permission was denied".to_string()
            }
            CallError::DeviceUnavailable(reason) => format!("Failed to start call: {}", reason),
            CallError::Negotiation(_) => "Call setup failed. Please try again.".to_string(),
            CallError::ConnectionFailed(_) => "Connection failed. Please try again.".to_string(),
            CallError::NoTarget(_) => "There is nobody to call in this conversation".to_string(),
            CallError::SessionActive(_) => "A call is already in progress".to_string(),
            CallError::SessionClosed => "The call has already ended".to_string(),
            CallError::InvalidState(reason) => reason.clone(),
            CallError::ScreenShare(_) => "Failed to start screen sharing".to_string(),
            CallError::Directory(_) => "Failed to look up the call participant".to_string(),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(reason) => CallError::PermissionDenied(reason),
            MediaError::DeviceUnavailable(reason) => CallError::DeviceUnavailable(reason),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Negotiation(reason) => CallError::Negotiation(reason),
            PeerError::Closed => CallError::Negotiation("peer connection is closed".to_string()),
            PeerError::WebRTC(reason) => CallError::Negotiation(reason),
        }
    }
}
