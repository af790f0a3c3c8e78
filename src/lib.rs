//! callcore - Anruf-Kern für Zwei-Personen-Gespräche
//!
//! Signalisierung und Medien-Aushandlung eines WebRTC-Anrufs:
//! - Capture-Tracks für Mikrofon, Kamera und Bildschirm
//! - Eine Peer Connection pro Anruf (Offer/Answer, ICE)
//! - State Machine pro Session als eigener Task
//! - Envelopes über einen WebSocket-Relay
//! - Presenter für Sprach- und Video-Ansicht

pub mod call_engine;
pub mod config;
pub mod directory;
pub mod media;
pub mod peer;
pub mod presenter;
pub mod signaling;

#[cfg(test)]
mod test_support;

pub use call_engine::{
    CallCoordinator, CallError, CallHandle, CallMode, CallSnapshot, CallStatus, ConversationId,
    ParticipantId,
};
pub use config::AppConfig;
pub use presenter::{CallPresenter, CallView, PresenterVariant};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "callcore=debug,webrtc=warn";

/// Initialisiert das Logging (einmal pro Prozess)
///
/// `RUST_LOG` hat Vorrang vor dem Standard-Filter.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
