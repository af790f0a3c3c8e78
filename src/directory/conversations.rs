//! Conversation Directory
//!
//! SQLite-Datenbank für Konversationen und ihre Teilnehmer.
//! Beantwortet die Frage, wen ein Anruf in einer Konversation erreicht.

use crate::call_engine::{ConversationId, ParticipantId};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),
}

// ============================================================================
// LOOKUP TRAIT
// ============================================================================

/// Ermittelt das Anrufziel einer Konversation
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    /// Gibt den anderen Teilnehmer der Konversation zurück
    ///
    /// Online-Teilnehmer werden bevorzugt, danach der zuerst beigetretene.
    async fn lookup_active_participant(
        &self,
        conversation: ConversationId,
        local: &ParticipantId,
    ) -> Result<Option<ParticipantId>, DirectoryError>;
}

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub participant_id: ParticipantId,
    pub display_name: Option<String>,
    pub is_online: bool,
    pub joined_at: String,
}

/// Neuer Teilnehmer (für INSERT)
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub participant_id: ParticipantId,
    pub display_name: Option<String>,
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Konversationen (Thread-safe durch Mutex)
pub struct ConversationDirectory {
    conn: Mutex<Connection>,
}

impl ConversationDirectory {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening directory database at {:?}", path);

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-Memory Datenbank (Tests, kurzlebige Sessions)
    pub fn open_in_memory() -> Result<Self, DirectoryError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Standard-Pfad im Datenverzeichnis der Plattform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "callcore", "callcore")
            .map(|dirs| dirs.data_dir().join("directory.db"))
    }

    fn init_schema(&self) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS conversation_participants (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                participant_id TEXT NOT NULL,
                display_name TEXT,
                is_online INTEGER NOT NULL DEFAULT 0,
                joined_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(conversation_id, participant_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_participant
                ON conversation_participants(participant_id);
            "#,
        )?;
        Ok(())
    }

    /// Legt eine Konversation an (oder aktualisiert den Titel)
    pub fn add_conversation(
        &self,
        conversation: ConversationId,
        title: Option<&str>,
    ) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO conversations (id, title) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET title = COALESCE(excluded.title, title)
            "#,
            params![conversation.0, title],
        )?;
        Ok(())
    }

    /// Fügt einen Teilnehmer zu einer Konversation hinzu
    pub fn add_participant(
        &self,
        conversation: ConversationId,
        participant: NewParticipant,
    ) -> Result<Participant, DirectoryError> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1",
                params![conversation.0],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DirectoryError::ConversationNotFound(conversation));
        }

        conn.execute(
            r#"
            INSERT INTO conversation_participants (conversation_id, participant_id, display_name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(conversation_id, participant_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, display_name)
            "#,
            params![
                conversation.0,
                participant.participant_id.as_str(),
                participant.display_name
            ],
        )?;

        let record = conn.query_row(
            r#"
            SELECT conversation_id, participant_id, display_name, is_online, joined_at
            FROM conversation_participants
            WHERE conversation_id = ?1 AND participant_id = ?2
            "#,
            params![conversation.0, participant.participant_id.as_str()],
            Self::map_participant,
        )?;
        Ok(record)
    }

    /// Alle Teilnehmer einer Konversation in Beitrittsreihenfolge
    pub fn participants(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Participant>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT conversation_id, participant_id, display_name, is_online, joined_at
            FROM conversation_participants
            WHERE conversation_id = ?1
            ORDER BY seq ASC
            "#,
        )?;

        let participants = stmt
            .query_map(params![conversation.0], Self::map_participant)?
            .collect::<SqliteResult<Vec<Participant>>>()?;
        Ok(participants)
    }

    /// Aktualisiert den Online-Status in allen Konversationen
    pub fn set_online_status(
        &self,
        participant: &ParticipantId,
        is_online: bool,
    ) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversation_participants SET is_online = ?2 WHERE participant_id = ?1",
            params![participant.as_str(), is_online as i32],
        )?;
        Ok(())
    }

    /// Setzt alle Teilnehmer auf offline
    pub fn set_all_offline(&self) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute("UPDATE conversation_participants SET is_online = 0", [])?;
        Ok(())
    }

    /// Entfernt einen Teilnehmer aus einer Konversation
    pub fn remove_participant(
        &self,
        conversation: ConversationId,
        participant: &ParticipantId,
    ) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            DELETE FROM conversation_participants
            WHERE conversation_id = ?1 AND participant_id = ?2
            "#,
            params![conversation.0, participant.as_str()],
        )?;
        Ok(())
    }

    fn map_participant(row: &rusqlite::Row<'_>) -> SqliteResult<Participant> {
        Ok(Participant {
            conversation_id: ConversationId(row.get(0)?),
            participant_id: ParticipantId::new(row.get::<_, String>(1)?),
            display_name: row.get(2)?,
            is_online: row.get::<_, i32>(3)? != 0,
            joined_at: row.get(4)?,
        })
    }
}

#[async_trait]
impl ParticipantDirectory for ConversationDirectory {
    async fn lookup_active_participant(
        &self,
        conversation: ConversationId,
        local: &ParticipantId,
    ) -> Result<Option<ParticipantId>, DirectoryError> {
        let conn = self.conn.lock();
        let participant: Option<String> = conn
            .query_row(
                r#"
                SELECT participant_id
                FROM conversation_participants
                WHERE conversation_id = ?1 AND participant_id != ?2
                ORDER BY is_online DESC, seq ASC
                LIMIT 1
                "#,
                params![conversation.0, local.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(participant.map(ParticipantId::new))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str) -> NewParticipant {
        NewParticipant {
            participant_id: ParticipantId::new(id),
            display_name: None,
        }
    }

    fn directory() -> ConversationDirectory {
        let db = ConversationDirectory::open_in_memory().unwrap();
        db.add_conversation(ConversationId(1), Some("alice & bob"))
            .unwrap();
        db.add_participant(ConversationId(1), participant("U1"))
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_lookup_returns_other_participant() {
        let db = directory();
        db.add_participant(ConversationId(1), participant("U2"))
            .unwrap();

        let target = db
            .lookup_active_participant(ConversationId(1), &ParticipantId::new("U1"))
            .await
            .unwrap();
        assert_eq!(target, Some(ParticipantId::new("U2")));
    }

    #[tokio::test]
    async fn test_lookup_without_other_participant() {
        let db = directory();

        let target = db
            .lookup_active_participant(ConversationId(1), &ParticipantId::new("U1"))
            .await
            .unwrap();
        assert_eq!(target, None);

        let unknown = db
            .lookup_active_participant(ConversationId(99), &ParticipantId::new("U1"))
            .await
            .unwrap();
        assert_eq!(unknown, None);
    }

    #[tokio::test]
    async fn test_lookup_prefers_online_participant() {
        let db = directory();
        db.add_participant(ConversationId(1), participant("U2"))
            .unwrap();
        db.add_participant(ConversationId(1), participant("U3"))
            .unwrap();
        db.set_online_status(&ParticipantId::new("U3"), true)
            .unwrap();

        let target = db
            .lookup_active_participant(ConversationId(1), &ParticipantId::new("U1"))
            .await
            .unwrap();
        assert_eq!(target, Some(ParticipantId::new("U3")));

        db.set_all_offline().unwrap();
        let target = db
            .lookup_active_participant(ConversationId(1), &ParticipantId::new("U1"))
            .await
            .unwrap();
        assert_eq!(target, Some(ParticipantId::new("U2")));
    }

    #[test]
    fn test_add_participant_requires_conversation() {
        let db = ConversationDirectory::open_in_memory().unwrap();
        assert!(matches!(
            db.add_participant(ConversationId(4), participant("U1")),
            Err(DirectoryError::ConversationNotFound(ConversationId(4)))
        ));
    }

    #[test]
    fn test_participants_and_removal() {
        let db = directory();
        db.add_participant(
            ConversationId(1),
            NewParticipant {
                participant_id: ParticipantId::new("U2"),
                display_name: Some("Bob".to_string()),
            },
        )
        .unwrap();

        let all = db.participants(ConversationId(1)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].display_name.as_deref(), Some("Bob"));

        db.remove_participant(ConversationId(1), &ParticipantId::new("U2"))
            .unwrap();
        assert_eq!(db.participants(ConversationId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("directory.db");

        let db = ConversationDirectory::open(&path).unwrap();
        db.add_conversation(ConversationId(1), None).unwrap();
        drop(db);

        let reopened = ConversationDirectory::open(&path).unwrap();
        reopened
            .add_participant(ConversationId(1), participant("U1"))
            .unwrap();
        assert!(path.exists());
    }
}
