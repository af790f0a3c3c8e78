//! Media Capture Adapter
//!
//! Fordert Mikrofon, Kamera und Bildschirmfreigabe beim System an.

use super::track::{LocalTrack, MediaTrackSet, TrackSource};
use crate::call_engine::CallMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream-ID aller lokal erzeugten Tracks
pub const LOCAL_STREAM_ID: &str = "callcore-local";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

// ============================================================================
// CAPTURE PROFILE
// ============================================================================

/// Gewünschte Capture-Parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
            sample_rate: 48000,
            channels: 1,
        }
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Zugriff auf lokale Capture-Geräte
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fordert Mikrofon (und bei Video die Kamera) an
    ///
    /// Kann beliebig lange auf eine Benutzerentscheidung warten.
    async fn acquire(
        &self,
        mode: CallMode,
        profile: &CaptureProfile,
    ) -> Result<MediaTrackSet, MediaError>;

    /// Fordert nur die Kamera an (Rückkehr vom Screen Share)
    async fn acquire_camera(&self, profile: &CaptureProfile) -> Result<LocalTrack, MediaError>;

    /// Fordert eine Bildschirmfreigabe an
    async fn acquire_display_capture(&self) -> Result<LocalTrack, MediaError>;
}

/// Geräte des lokalen Systems
///
/// Mikrofon über cpal (Feature `system-audio`). Für Kamera und Bildschirm
/// gibt es kein Backend, diese Anfragen schlagen mit `DeviceUnavailable` fehl.
#[derive(Debug, Default)]
pub struct SystemMediaDevices;

impl SystemMediaDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    async fn acquire(
        &self,
        mode: CallMode,
        profile: &CaptureProfile,
    ) -> Result<MediaTrackSet, MediaError> {
        let audio = LocalTrack::new(TrackSource::Microphone, LOCAL_STREAM_ID);
        let capture = open_microphone(profile)?;
        audio.attach_capture(capture);

        // Bei Fehlern gibt das Drop des Sets das Mikrofon wieder frei
        let mut tracks = MediaTrackSet::new(Some(audio), None);
        if mode.is_video() {
            let camera = self.acquire_camera(profile).await?;
            tracks.replace_video(camera);
        }

        tracing::info!("Acquired local media for {} call", mode.as_str());
        Ok(tracks)
    }

    async fn acquire_camera(&self, profile: &CaptureProfile) -> Result<LocalTrack, MediaError> {
        tracing::warn!(
            "Camera capture requested ({}x{}@{}) but no camera backend is available",
            profile.width,
            profile.height,
            profile.frame_rate
        );
        Err(MediaError::DeviceUnavailable(
            "no camera backend available".to_string(),
        ))
    }

    async fn acquire_display_capture(&self) -> Result<LocalTrack, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "no display capture backend available".to_string(),
        ))
    }
}

#[cfg(feature = "system-audio")]
fn open_microphone(
    profile: &CaptureProfile,
) -> Result<Box<dyn super::track::CaptureHandle>, MediaError> {
    let capture = super::microphone::MicrophoneCapture::open(profile)?;
    Ok(Box::new(capture))
}

#[cfg(not(feature = "system-audio"))]
fn open_microphone(
    _profile: &CaptureProfile,
) -> Result<Box<dyn super::track::CaptureHandle>, MediaError> {
    Err(MediaError::DeviceUnavailable(
        "audio capture is not compiled in (enable the `system-audio` feature)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let profile = CaptureProfile::default();
        assert_eq!((profile.width, profile.height), (640, 480));
        assert_eq!(profile.sample_rate, 48000);
    }

    #[tokio::test]
    async fn test_system_devices_have_no_display_backend() {
        let devices = SystemMediaDevices::new();
        let err = devices.acquire_display_capture().await.unwrap_err();
        assert!(matches!(err, MediaError::DeviceUnavailable(_)));

        let err = devices
            .acquire_camera(&CaptureProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::DeviceUnavailable(_)));
    }
}
