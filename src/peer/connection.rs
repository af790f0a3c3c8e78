//! Peer Connection Manager
//!
//! Erstellt Peer Connections für einen Anruf und erzwingt die Reihenfolge
//! der Offer/Answer-Schritte. Remote ICE Candidates, die vor der Remote
//! Description eintreffen, werden gepuffert und danach in Ankunftsreihenfolge
//! angewendet.

use super::engine::{PeerEngine, PeerEngineFactory, PeerError, PeerEventSink, SdpKind};
use super::candidate::CandidateDescriptor;
use crate::call_engine::ParticipantId;
use crate::media::{LocalTrack, MediaTrackSet, TrackKind};
use std::collections::VecDeque;
use std::sync::Arc;

/// Verhandlungsstand einer Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    Stable,
    Closed,
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct PeerConnectionManager {
    factory: Arc<dyn PeerEngineFactory>,
    ice_urls: Vec<String>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn PeerEngineFactory>, ice_urls: Vec<String>) -> Self {
        Self { factory, ice_urls }
    }

    pub fn ice_urls(&self) -> &[String] {
        &self.ice_urls
    }

    /// Erstellt eine Peer Connection mit allen lokalen Tracks
    pub async fn create(
        &self,
        tracks: &MediaTrackSet,
        target: &ParticipantId,
        sink: PeerEventSink,
    ) -> Result<PeerConnectionHandle, PeerError> {
        let engine = self.factory.create(&self.ice_urls, sink).await?;

        for track in tracks.local_tracks() {
            if let Err(e) = engine.add_track(&track).await {
                if let Err(close_err) = engine.close().await {
                    tracing::warn!("Failed to close peer connection: {}", close_err);
                }
                return Err(e);
            }
        }

        tracing::info!("Created peer connection to {}", target);
        Ok(PeerConnectionHandle {
            target: target.clone(),
            engine,
            state: NegotiationState::New,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
        })
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Eine Peer Connection zu genau einem Teilnehmer
pub struct PeerConnectionHandle {
    target: ParticipantId,
    engine: Box<dyn PeerEngine>,
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: VecDeque<CandidateDescriptor>,
}

impl PeerConnectionHandle {
    pub fn target(&self) -> &ParticipantId {
        &self.target
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Erstellt das Offer (Anrufer)
    pub async fn create_offer(&mut self) -> Result<String, PeerError> {
        match self.state {
            NegotiationState::New => {
                let sdp = self.engine.create_offer().await?;
                self.state = NegotiationState::HaveLocalOffer;
                Ok(sdp)
            }
            NegotiationState::Closed => Err(PeerError::Closed),
            other => Err(PeerError::Negotiation(format!(
                "cannot create offer in state {:?}",
                other
            ))),
        }
    }

    /// Wendet das Remote Offer an und gibt das Answer zurück (Angerufener)
    pub async fn apply_remote_offer(&mut self, sdp: String) -> Result<String, PeerError> {
        match self.state {
            NegotiationState::New => {}
            NegotiationState::Closed => return Err(PeerError::Closed),
            NegotiationState::HaveLocalOffer => {
                return Err(PeerError::Negotiation(
                    "remote offer while a local offer is pending".to_string(),
                ))
            }
            NegotiationState::Stable => {
                return Err(PeerError::Negotiation(
                    "remote offer after negotiation completed".to_string(),
                ))
            }
        }

        self.engine.set_remote_description(SdpKind::Offer, sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.engine.create_answer().await?;
        self.state = NegotiationState::Stable;
        Ok(answer)
    }

    /// Wendet das Remote Answer an (Anrufer)
    pub async fn apply_remote_answer(&mut self, sdp: String) -> Result<(), PeerError> {
        match self.state {
            NegotiationState::HaveLocalOffer => {}
            NegotiationState::Closed => return Err(PeerError::Closed),
            other => {
                return Err(PeerError::Negotiation(format!(
                    "unexpected answer in state {:?}",
                    other
                )))
            }
        }

        self.engine.set_remote_description(SdpKind::Answer, sdp).await?;
        self.remote_description_set = true;
        self.state = NegotiationState::Stable;
        self.flush_candidates().await;
        Ok(())
    }

    /// Fügt einen Remote Candidate hinzu oder puffert ihn
    pub async fn add_remote_candidate(
        &mut self,
        candidate: CandidateDescriptor,
    ) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        if !self.remote_description_set {
            tracing::debug!("Buffering remote ICE candidate until remote description is set");
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }

        self.engine.add_ice_candidate(candidate).await
    }

    /// Tauscht die Video-Quelle (Screen Share)
    pub async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        if track.kind() != TrackKind::Video {
            return Err(PeerError::Negotiation(
                "replacement track must be a video track".to_string(),
            ));
        }
        self.engine.replace_video_track(track).await
    }

    /// Schließt die Verbindung. Gibt `false` zurück wenn sie schon zu war.
    pub async fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();

        if let Err(e) = self.engine.close().await {
            tracing::warn!("Failed to close peer connection to {}: {}", self.target, e);
        }
        tracing::info!("Closed peer connection to {}", self.target);
        true
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{TrackSource, LOCAL_STREAM_ID};
    use crate::peer::PeerEvent;
    use crate::test_support::{EngineCall, FakePeerFactory};

    fn sink() -> PeerEventSink {
        Arc::new(|_: PeerEvent| {})
    }

    async fn handle(factory: &Arc<FakePeerFactory>) -> PeerConnectionHandle {
        let manager = PeerConnectionManager::new(factory.clone(), Vec::new());
        let tracks = MediaTrackSet::new(
            Some(LocalTrack::new(TrackSource::Microphone, LOCAL_STREAM_ID)),
            None,
        );
        manager
            .create(&tracks, &ParticipantId::new("U2"), sink())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_adds_local_tracks() {
        let factory = Arc::new(FakePeerFactory::new());
        let _handle = handle(&factory).await;

        assert_eq!(factory.created(), 1);
        assert!(matches!(factory.calls()[0], EngineCall::AddTrack(_)));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let factory = Arc::new(FakePeerFactory::new());
        let mut handle = handle(&factory).await;

        handle.create_offer().await.unwrap();
        handle
            .add_remote_candidate(CandidateDescriptor::new("c1"))
            .await
            .unwrap();
        handle
            .add_remote_candidate(CandidateDescriptor::new("c2"))
            .await
            .unwrap();
        assert_eq!(handle.pending_candidate_count(), 2);
        assert!(factory.applied_candidates().is_empty());

        handle.apply_remote_answer("answer".to_string()).await.unwrap();
        handle
            .add_remote_candidate(CandidateDescriptor::new("c3"))
            .await
            .unwrap();

        assert_eq!(handle.pending_candidate_count(), 0);
        assert_eq!(factory.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(handle.negotiation_state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_remote_offer_applies_buffered_candidates_before_answer() {
        let factory = Arc::new(FakePeerFactory::new());
        let mut handle = handle(&factory).await;

        handle
            .add_remote_candidate(CandidateDescriptor::new("early"))
            .await
            .unwrap();
        let answer = handle.apply_remote_offer("offer".to_string()).await.unwrap();
        assert!(!answer.is_empty());

        let calls = factory.calls();
        let set_remote = calls
            .iter()
            .position(|c| matches!(c, EngineCall::SetRemote(SdpKind::Offer, _)))
            .unwrap();
        let candidate = calls
            .iter()
            .position(|c| matches!(c, EngineCall::AddCandidate(_)))
            .unwrap();
        let answer = calls
            .iter()
            .position(|c| matches!(c, EngineCall::CreateAnswer))
            .unwrap();
        assert!(set_remote < candidate && candidate < answer);
    }

    #[tokio::test]
    async fn test_out_of_sequence_operations_rejected() {
        let factory = Arc::new(FakePeerFactory::new());
        let mut handle = handle(&factory).await;

        assert!(matches!(
            handle.apply_remote_answer("answer".to_string()).await,
            Err(PeerError::Negotiation(_))
        ));

        handle.create_offer().await.unwrap();
        assert!(matches!(
            handle.create_offer().await,
            Err(PeerError::Negotiation(_))
        ));
        assert!(matches!(
            handle.apply_remote_offer("offer".to_string()).await,
            Err(PeerError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = Arc::new(FakePeerFactory::new());
        let mut handle = handle(&factory).await;

        handle
            .add_remote_candidate(CandidateDescriptor::new("c1"))
            .await
            .unwrap();
        assert!(handle.close().await);
        assert!(!handle.close().await);
        assert_eq!(handle.pending_candidate_count(), 0);

        let closes = factory
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Close))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(
            handle.create_offer().await.unwrap_err(),
            PeerError::Closed
        );
    }

    #[tokio::test]
    async fn test_replace_requires_video_track() {
        let factory = Arc::new(FakePeerFactory::new());
        let handle = handle(&factory).await;

        let audio = LocalTrack::new(TrackSource::Microphone, LOCAL_STREAM_ID);
        assert!(handle.replace_video_track(&audio).await.is_err());

        let display = LocalTrack::new(TrackSource::Display, LOCAL_STREAM_ID);
        handle.replace_video_track(&display).await.unwrap();
        assert!(factory
            .calls()
            .contains(&EngineCall::ReplaceVideo(display.id().to_string())));
    }
}
