//! Media Module - lokale Capture-Tracks
//!
//! - Track-Modell (Audio/Video, Enable-Flag, Ende-Benachrichtigung)
//! - Capture-Adapter für Mikrofon, Kamera und Bildschirm

mod devices;
#[cfg(feature = "system-audio")]
mod microphone;
mod track;

pub use devices::{CaptureProfile, MediaDevices, MediaError, SystemMediaDevices, LOCAL_STREAM_ID};
#[cfg(feature = "system-audio")]
pub use microphone::MicrophoneCapture;
pub use track::{
    CaptureHandle, LocalTrack, MediaTrackSet, RemoteTrack, TrackKind, TrackSource, TrackState,
};
