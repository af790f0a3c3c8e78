//! Call Engine Module - Anruf-Sessions
//!
//! Dieses Modul verwaltet:
//! - Das Session-Aggregat und seine Zustände
//! - Die State Machine pro Anruf (Actor-Task)
//! - Die Registry aller laufenden Anrufe

mod coordinator;
mod error;
mod handle;
mod machine;
mod state;

pub use coordinator::{CallCoordinator, CoordinatorEvent, SessionRegistry};
pub use error::CallError;
pub use handle::{CallCommand, CallHandle, CallSnapshot};
pub use machine::{
    CallContext, CallSessionMachine, CallSettings, DEFAULT_DISCONNECT_GRACE,
    DEFAULT_NEGOTIATION_TIMEOUT,
};
pub use state::{
    CallMode, CallRole, CallSession, CallStatus, ConversationId, EndReason, ParticipantId,
    SessionId,
};
