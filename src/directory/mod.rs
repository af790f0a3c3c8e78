//! Directory Module - Konversationen und Teilnehmer

mod conversations;

pub use conversations::{
    ConversationDirectory, DirectoryError, NewParticipant, Participant, ParticipantDirectory,
};
