//! Call Coordinator
//!
//! Prozessweite Registry der laufenden Sessions, eine pro Konversation.
//! Startet Sessions, verwaltet eingehende Anrufe und verteilt
//! eingehende Envelopes an die zuständige Session.

use super::error::CallError;
use super::handle::CallHandle;
use super::machine::{CallContext, CallSessionMachine};
use super::state::{CallMode, CallRole, CallSession, ConversationId, ParticipantId, SessionId};
use crate::directory::ParticipantDirectory;
use crate::signaling::{
    EnvelopeType, Signal, SignalPayload, SignalingAdapter, SignalingEnvelope, SignalingEvent,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// SESSION REGISTRY
// ============================================================================

/// Laufende Sessions nach Konversation
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<ConversationId, CallHandle>>>,
}

impl SessionRegistry {
    /// Registriert eine Session, falls die Konversation frei ist
    ///
    /// Eine beendete Session, die sich noch nicht abgemeldet hat, wird
    /// ersetzt.
    fn insert(&self, handle: CallHandle) -> Result<(), CallError> {
        let mut sessions = self.sessions.lock();
        let conversation = handle.conversation_id();
        if sessions
            .get(&conversation)
            .map_or(false, |existing| !existing.is_finished())
        {
            return Err(CallError::SessionActive(conversation));
        }
        sessions.insert(conversation, handle);
        Ok(())
    }

    pub fn get(&self, conversation: ConversationId) -> Option<CallHandle> {
        self.sessions.lock().get(&conversation).cloned()
    }

    pub fn contains(&self, conversation: ConversationId) -> bool {
        self.sessions.lock().contains_key(&conversation)
    }

    /// Ob in der Konversation eine nicht beendete Session läuft
    pub fn is_active(&self, conversation: ConversationId) -> bool {
        self.sessions
            .lock()
            .get(&conversation)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Entfernt die Session, sofern sie noch die registrierte ist
    pub fn remove(&self, conversation: ConversationId, session: SessionId) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&conversation) {
            Some(handle) if handle.session_id() == session => {
                sessions.remove(&conversation);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Eingehender Anruf wartet auf Annahme
    IncomingCall {
        conversation_id: ConversationId,
        from: ParticipantId,
        mode: CallMode,
    },
    /// Anrufer hat vor der Annahme aufgelegt
    InviteWithdrawn { conversation_id: ConversationId },
    /// Neue Session gestartet
    SessionStarted {
        conversation_id: ConversationId,
        session_id: SessionId,
        role: CallRole,
    },
}

/// Eingehender, noch nicht angenommener Anruf
struct PendingInvite {
    from: ParticipantId,
    mode: CallMode,
    session_id: Option<SessionId>,
    queued: Vec<Signal>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct CallCoordinator {
    local: ParticipantId,
    directory: Arc<dyn ParticipantDirectory>,
    ctx: CallContext,
    registry: SessionRegistry,
    invites: Mutex<HashMap<ConversationId, PendingInvite>>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
}

impl CallCoordinator {
    pub fn new(
        local: ParticipantId,
        directory: Arc<dyn ParticipantDirectory>,
        ctx: CallContext,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            local,
            directory,
            ctx,
            registry: SessionRegistry::default(),
            invites: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Ohne Anrufziel schlägt der Aufruf sofort mit `NoTarget` fehl,
    /// ohne Geräte anzufordern.
    pub async fn start_call(
        &self,
        conversation: ConversationId,
        mode: CallMode,
    ) -> Result<CallHandle, CallError> {
        if self.registry.is_active(conversation) {
            return Err(CallError::SessionActive(conversation));
        }

        let remote = self
            .directory
            .lookup_active_participant(conversation, &self.local)
            .await
            .map_err(|e| CallError::Directory(e.to_string()))?
            .ok_or(CallError::NoTarget(conversation))?;

        // Ein wartender Anruf in derselben Konversation wird abgelehnt
        let _ = self.decline_call(conversation);
        self.spawn_session(conversation, remote, mode, CallRole::Caller, None, Vec::new())
    }

    /// Nimmt einen eingehenden Anruf an
    pub fn answer_call(&self, conversation: ConversationId) -> Result<CallHandle, CallError> {
        if self.registry.is_active(conversation) {
            return Err(CallError::SessionActive(conversation));
        }

        let invite = self.invites.lock().remove(&conversation).ok_or_else(|| {
            CallError::InvalidState(format!("no incoming call for conversation {}", conversation))
        })?;

        tracing::info!(
            "Answering {} call from {} in conversation {}",
            invite.mode.as_str(),
            invite.from,
            conversation
        );
        self.spawn_session(
            conversation,
            invite.from,
            invite.mode,
            CallRole::Callee,
            invite.session_id,
            invite.queued,
        )
    }

    /// Lehnt einen eingehenden Anruf ab
    pub fn decline_call(&self, conversation: ConversationId) -> Result<(), CallError> {
        let invite = self.invites.lock().remove(&conversation).ok_or_else(|| {
            CallError::InvalidState(format!("no incoming call for conversation {}", conversation))
        })?;

        tracing::info!("Declining call from {} in conversation {}", invite.from, conversation);
        let adapter = SignalingAdapter::new(
            Arc::clone(&self.ctx.signaling),
            conversation,
            self.local.clone(),
            invite.from,
            SessionId::new(),
        );
        adapter.send_call_end(invite.mode);
        Ok(())
    }

    /// Beendet den Anruf einer Konversation
    pub fn end_call(&self, conversation: ConversationId) -> Result<(), CallError> {
        self.registry
            .get(conversation)
            .ok_or(CallError::SessionClosed)?
            .end_call()
    }

    pub fn active_session(&self, conversation: ConversationId) -> Option<CallHandle> {
        self.registry.get(conversation)
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn pending_invites(&self) -> Vec<ConversationId> {
        let mut invites: Vec<_> = self.invites.lock().keys().copied().collect();
        invites.sort();
        invites
    }

    /// Verteilt ein eingehendes Envelope
    ///
    /// Unbekannte oder fehlerhafte Envelopes werden geloggt und verworfen.
    pub fn handle_envelope(&self, envelope: SignalingEnvelope) {
        let signal = match envelope.decode() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!("Ignoring signaling envelope: {}", e);
                return;
            }
        };

        if signal.target != self.local {
            tracing::debug!("Ignoring envelope addressed to {}", signal.target);
            return;
        }

        let conversation = signal.conversation_id;
        if self.belongs_to_invite(&signal) {
            return self.handle_idle_signal(signal);
        }

        match self.registry.get(conversation) {
            Some(handle) if !handle.is_finished() && !Self::starts_new_call(&handle, &signal) => {
                if !handle.deliver(signal) {
                    tracing::debug!("Session for conversation {} already finished", conversation);
                }
            }
            _ => self.handle_idle_signal(signal),
        }
    }

    /// Ein call-start, der nicht zur laufenden Session gehört (z.B. Rückruf
    /// direkt nach dem Auflegen), wird als neuer Anruf behandelt
    fn starts_new_call(handle: &CallHandle, signal: &Signal) -> bool {
        matches!(signal.payload, SignalPayload::CallStart { .. })
            && (signal.session_id.is_none() || signal.session_id != handle.remote_session())
    }

    /// Signal eines wartenden Anrufs mit derselben Session-ID
    fn belongs_to_invite(&self, signal: &Signal) -> bool {
        let Some(session) = signal.session_id else {
            return false;
        };
        self.invites
            .lock()
            .get(&signal.conversation_id)
            .map_or(false, |invite| invite.session_id == Some(session))
    }

    /// Signale für Konversationen ohne laufende Session
    fn handle_idle_signal(&self, signal: Signal) {
        let conversation = signal.conversation_id;
        let kind = signal.payload.envelope_type();

        match kind {
            EnvelopeType::CallStart => {
                let SignalPayload::CallStart { mode } = &signal.payload else {
                    return;
                };
                let mode = *mode;
                let Some(from) = signal.from.clone() else {
                    tracing::warn!("Ignoring call-start without sender");
                    return;
                };

                tracing::info!(
                    "Incoming {} call from {} in conversation {}",
                    mode.as_str(),
                    from,
                    conversation
                );
                self.invites.lock().insert(
                    conversation,
                    PendingInvite {
                        from: from.clone(),
                        mode,
                        session_id: signal.session_id,
                        queued: Vec::new(),
                    },
                );
                let _ = self.event_tx.send(CoordinatorEvent::IncomingCall {
                    conversation_id: conversation,
                    from,
                    mode,
                });
            }
            EnvelopeType::CallEnd => {
                let withdrawn = {
                    let mut invites = self.invites.lock();
                    match invites.get(&conversation) {
                        Some(invite) if Self::same_caller(invite, &signal) => {
                            invites.remove(&conversation);
                            true
                        }
                        _ => false,
                    }
                };
                if withdrawn {
                    tracing::info!("Incoming call in conversation {} was withdrawn", conversation);
                    let _ = self.event_tx.send(CoordinatorEvent::InviteWithdrawn {
                        conversation_id: conversation,
                    });
                }
            }
            EnvelopeType::Offer | EnvelopeType::IceCandidate => {
                let mut invites = self.invites.lock();
                match invites.get_mut(&conversation) {
                    Some(invite) if Self::same_caller(invite, &signal) => {
                        tracing::debug!("Queueing {} for pending call", kind);
                        invite.queued.push(signal);
                    }
                    _ => tracing::debug!(
                        "Ignoring {} without a call in conversation {}",
                        kind,
                        conversation
                    ),
                }
            }
            EnvelopeType::Answer => {
                tracing::debug!("Ignoring answer without a call in conversation {}", conversation);
            }
        }
    }

    fn same_caller(invite: &PendingInvite, signal: &Signal) -> bool {
        let same_sender = signal.from.as_ref().map_or(true, |from| *from == invite.from);
        let same_session = match (invite.session_id, signal.session_id) {
            (Some(known), Some(session)) => known == session,
            _ => true,
        };
        same_sender && same_session
    }

    /// Verteilt Relay-Events bis der Relay-Client verschwindet
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<SignalingEvent>) {
        loop {
            match events.recv().await {
                Ok(SignalingEvent::Envelope(envelope)) => self.handle_envelope(envelope),
                Ok(SignalingEvent::Connected) => tracing::info!("Signaling relay connected"),
                Ok(SignalingEvent::Disconnected) => {
                    tracing::warn!("Signaling relay disconnected");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} signaling events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn spawn_session(
        &self,
        conversation: ConversationId,
        remote: ParticipantId,
        mode: CallMode,
        role: CallRole,
        remote_session: Option<SessionId>,
        queued: Vec<Signal>,
    ) -> Result<CallHandle, CallError> {
        let session = CallSession::new(conversation, self.local.clone(), remote, mode, role);
        let session_id = session.id();
        let (handle, machine) =
            CallSessionMachine::new(session, self.ctx.clone(), Some(self.registry.clone()));
        let handle = handle.bound_to(remote_session);

        self.registry.insert(handle.clone())?;

        // Vorab empfangene Signale in Ankunftsreihenfolge einspielen
        for signal in queued {
            handle.deliver(signal);
        }
        tokio::spawn(machine.run());

        let _ = self.event_tx.send(CoordinatorEvent::SessionStarted {
            conversation_id: conversation,
            session_id,
            role,
        });
        Ok(handle)
    }
}

// ============================================================================
// TESTS
// ============================================================================
