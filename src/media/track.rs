//! Lokale und entfernte Media-Tracks
//!
//! Ein `LocalTrack` bündelt die RTP-Quelle für die Peer Connection mit dem
//! Capture-Gerät dahinter. `MediaTrackSet` hält alle Tracks eines Anrufs
//! und gibt sie genau einmal frei.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Opus läuft immer mit 48kHz RTP-Clock
const OPUS_CLOCK_RATE: u32 = 48000;

/// Video RTP-Clock
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// TRACK TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Woher ein lokaler Track stammt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Display => TrackKind::Video,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::Display => "display",
        }
    }
}

/// Lebenszyklus eines lokalen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// Von uns gestoppt
    Stopped,
    /// Vom System beendet (z.B. "Freigabe beenden" im OS-Dialog)
    Ended,
}

/// Laufendes Capture hinter einem Track
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

struct TrackInner {
    id: String,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    state: watch::Sender<TrackState>,
    rtp: Arc<TrackLocalStaticSample>,
    capture: Mutex<Option<Box<dyn CaptureHandle>>>,
}

/// Lokaler Audio- oder Video-Track
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Erstellt einen neuen Track ohne angeschlossenes Capture
    pub fn new(source: TrackSource, stream_id: &str) -> Self {
        let id = format!("{}-{}", source.label(), Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(source.kind()),
            id.clone(),
            stream_id.to_string(),
        ));
        let (state, _) = watch::channel(TrackState::Live);

        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                enabled: Arc::new(AtomicBool::new(true)),
                state,
                rtp,
                capture: Mutex::new(None),
            }),
        }
    }

    /// Hängt das Capture an, das beim Stoppen mit beendet wird
    pub fn attach_capture(&self, handle: Box<dyn CaptureHandle>) {
        if self.is_live() {
            *self.inner.capture.lock() = Some(handle);
        } else {
            let mut handle = handle;
            handle.stop();
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stoppt den Track. Mehrfache Aufrufe sind wirkungslos.
    pub fn stop(&self) -> bool {
        self.finish(TrackState::Stopped)
    }

    /// Markiert den Track als vom System beendet
    pub fn end(&self) -> bool {
        self.finish(TrackState::Ended)
    }

    /// Wartet bis der Track nicht mehr live ist
    pub async fn finished(&self) -> TrackState {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != TrackState::Live {
                return state;
            }
            if rx.changed().await.is_err() {
                return TrackState::Stopped;
            }
        }
    }

    /// RTP-Quelle für die Peer Connection
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.inner.rtp) as Arc<dyn TrackLocal + Send + Sync>
    }

    fn finish(&self, next: TrackState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            if let Some(mut capture) = self.inner.capture.lock().take() {
                capture.stop();
            }
            tracing::debug!("Track {} finished: {:?}", self.inner.id, next);
        }
        changed
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: OPUS_CLOCK_RATE,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            ..Default::default()
        },
    }
}

// ============================================================================
// REMOTE TRACK
// ============================================================================

/// Vom Peer empfangener Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

// ============================================================================
// MEDIA TRACK SET
// ============================================================================

/// Alle Tracks eines Anrufs
///
/// Wird beim Droppen freigegeben, falls das noch nicht passiert ist.
#[derive(Debug, Default)]
pub struct MediaTrackSet {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    remote_audio: Option<RemoteTrack>,
    remote_video: Option<RemoteTrack>,
    released: bool,
}

impl MediaTrackSet {
    pub fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self {
            audio,
            video,
            remote_audio: None,
            remote_video: None,
            released: false,
        }
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    /// Alle lokalen Tracks (Audio zuerst)
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Aktiviert/deaktiviert den Track einer Art
    ///
    /// Gibt `false` zurück wenn kein solcher Track existiert.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let track = match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        };

        match track {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Ersetzt den Video-Track und stoppt den vorherigen
    pub fn replace_video(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        if self.released {
            track.stop();
            return None;
        }

        let previous = self.video.replace(track);
        if let Some(previous) = &previous {
            previous.stop();
        }
        previous
    }

    pub fn add_remote(&mut self, track: RemoteTrack) {
        match track.kind {
            TrackKind::Audio => self.remote_audio = Some(track),
            TrackKind::Video => self.remote_video = Some(track),
        }
    }

    pub fn has_remote_audio(&self) -> bool {
        self.remote_audio.is_some()
    }

    pub fn has_remote_video(&self) -> bool {
        self.remote_video.is_some()
    }

    /// Stoppt alle Tracks. Nur der erste Aufruf hat eine Wirkung.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        for track in self.audio.take().into_iter().chain(self.video.take()) {
            track.stop();
        }
        self.remote_audio = None;
        self.remote_video = None;

        tracing::debug!("Media tracks released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for MediaTrackSet {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingCapture(Arc<AtomicUsize>);

    impl CaptureHandle for CountingCapture {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_track_stop_is_idempotent() {
        let stops = Arc::new(AtomicUsize::new(0));
        let track = LocalTrack::new(TrackSource::Microphone, "test");
        track.attach_capture(Box::new(CountingCapture(Arc::clone(&stops))));

        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.end());
        assert_eq!(track.state(), TrackState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_set_starts_live_without_remote_tracks() {
        let audio = LocalTrack::new(TrackSource::Microphone, "test");
        let mut set = MediaTrackSet::new(Some(audio.clone()), None);

        assert!(!set.is_released());
        assert!(!set.has_remote_audio());
        assert!(!set.has_remote_video());
        assert_eq!(set.local_tracks().len(), 1);

        set.add_remote(RemoteTrack {
            id: "remote-audio".to_string(),
            kind: TrackKind::Audio,
        });
        assert!(set.has_remote_audio());
        assert!(set.release());
        assert!(!set.has_remote_audio());
    }

    #[test]
    fn test_release_is_idempotent() {
        let audio = LocalTrack::new(TrackSource::Microphone, "test");
        let video = LocalTrack::new(TrackSource::Camera, "test");
        let mut set = MediaTrackSet::new(Some(audio.clone()), Some(video.clone()));

        assert!(set.release());
        assert!(!set.release());
        assert!(set.is_released());
        assert!(!audio.is_live());
        assert!(!video.is_live());
        assert!(set.local_tracks().is_empty());
    }

    #[test]
    fn test_drop_releases_tracks() {
        let audio = LocalTrack::new(TrackSource::Microphone, "test");
        drop(MediaTrackSet::new(Some(audio.clone()), None));
        assert_eq!(audio.state(), TrackState::Stopped);
    }

    #[test]
    fn test_set_track_enabled_without_track() {
        let audio = LocalTrack::new(TrackSource::Microphone, "test");
        let set = MediaTrackSet::new(Some(audio.clone()), None);

        assert!(!set.set_track_enabled(TrackKind::Video, false));
        assert!(set.set_track_enabled(TrackKind::Audio, false));
        assert!(!audio.is_enabled());
    }

    #[test]
    fn test_replace_video_stops_previous() {
        let camera = LocalTrack::new(TrackSource::Camera, "test");
        let display = LocalTrack::new(TrackSource::Display, "test");
        let mut set = MediaTrackSet::new(None, Some(camera.clone()));

        let previous = set.replace_video(display.clone()).unwrap();
        assert_eq!(previous.id(), camera.id());
        assert!(!camera.is_live());
        assert!(display.is_live());
        assert_eq!(set.video().unwrap().source(), TrackSource::Display);
    }

    #[test]
    fn test_replace_after_release_stops_new_track() {
        let mut set = MediaTrackSet::new(None, None);
        set.release();

        let late = LocalTrack::new(TrackSource::Camera, "test");
        assert!(set.replace_video(late.clone()).is_none());
        assert!(!late.is_live());
    }

    #[tokio::test]
    async fn test_finished_reports_system_end() {
        let display = LocalTrack::new(TrackSource::Display, "test");
        let watcher = {
            let display = display.clone();
            tokio::spawn(async move { display.finished().await })
        };

        tokio::task::yield_now().await;
        display.end();

        assert_eq!(watcher.await.unwrap(), TrackState::Ended);
    }
}
