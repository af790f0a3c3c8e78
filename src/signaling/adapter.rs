//! Signaling Channel Adapter
//!
//! Versieht ausgehende Envelopes mit Absender und Session-ID und filtert
//! eingehende Signale, die nicht zur laufenden Session gehören.

use super::client::SignalingError;
use super::messages::{Signal, SignalPayload, SignalingEnvelope};
use crate::call_engine::{CallMode, ConversationId, ParticipantId, SessionId};
use crate::peer::CandidateDescriptor;
use std::sync::Arc;

/// Ausgehender Kanal zum Relay
///
/// Fire-and-forget: es wird nicht auf eine Bestätigung gewartet.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError>;
}

/// Signaling für genau eine Call-Session
pub struct SignalingAdapter {
    channel: Arc<dyn SignalingChannel>,
    conversation_id: ConversationId,
    local: ParticipantId,
    remote: ParticipantId,
    session_id: SessionId,
    remote_session: Option<SessionId>,
}

impl SignalingAdapter {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        conversation_id: ConversationId,
        local: ParticipantId,
        remote: ParticipantId,
        session_id: SessionId,
    ) -> Self {
        Self {
            channel,
            conversation_id,
            local,
            remote,
            session_id,
            remote_session: None,
        }
    }

    pub fn send_call_start(&self, mode: CallMode) {
        self.send(SignalPayload::CallStart { mode });
    }

    pub fn send_call_end(&self, mode: CallMode) {
        self.send(SignalPayload::CallEnd { mode });
    }

    pub fn send_offer(&self, sdp: String) {
        self.send(SignalPayload::Offer { sdp });
    }

    pub fn send_answer(&self, sdp: String) {
        self.send(SignalPayload::Answer { sdp });
    }

    pub fn send_candidate(&self, candidate: CandidateDescriptor) {
        self.send(SignalPayload::IceCandidate(candidate));
    }

    /// Sendet ein Signal an den Remote-Teilnehmer
    pub fn send(&self, payload: SignalPayload) {
        let kind = payload.envelope_type();
        let envelope = SignalingEnvelope::encode(&Signal {
            conversation_id: self.conversation_id,
            from: Some(self.local.clone()),
            target: self.remote.clone(),
            session_id: Some(self.session_id),
            payload,
        });

        match self.channel.send(envelope) {
            Ok(()) => tracing::debug!(
                session = %self.session_id,
                "Sent {} to {}",
                kind,
                self.remote
            ),
            Err(e) => tracing::warn!(
                session = %self.session_id,
                "Failed to send {} to {}: {}",
                kind,
                self.remote,
                e
            ),
        }
    }

    /// Prüft ob ein eingehendes Signal zu dieser Session gehört
    ///
    /// Die erste Remote-Session-ID wird übernommen; Signale mit einer
    /// anderen ID stammen aus einem früheren Anrufversuch.
    pub fn accept(&mut self, signal: &Signal) -> bool {
        if signal.conversation_id != self.conversation_id {
            tracing::warn!(
                "Dropping {} for conversation {} (session is for {})",
                signal.payload.envelope_type(),
                signal.conversation_id,
                self.conversation_id
            );
            return false;
        }

        if signal.target != self.local {
            tracing::warn!(
                "Dropping {} addressed to {}",
                signal.payload.envelope_type(),
                signal.target
            );
            return false;
        }

        if let Some(from) = &signal.from {
            if *from != self.remote {
                tracing::warn!(
                    "Dropping {} from unexpected participant {}",
                    signal.payload.envelope_type(),
                    from
                );
                return false;
            }
        }

        if let Some(session) = signal.session_id {
            match self.remote_session {
                None => self.remote_session = Some(session),
                Some(known) if known != session => {
                    tracing::warn!(
                        "Dropping {} from stale remote session {}",
                        signal.payload.envelope_type(),
                        session
                    );
                    return false;
                }
                Some(_) => {}
            }
        }

        true
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }
}
