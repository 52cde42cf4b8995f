//! Read-only access to the host application's chat history.
//!
//! The relational chat store itself belongs to the host; this crate only
//! needs two accessors, so they sit behind a narrow trait with a SQLite
//! implementation over the host's `messages` table.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::PathBuf;

/// One conversation turn as stored by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    /// "user" or "assistant".
    pub role: String,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            text: text.into(),
        }
    }
}

/// Read-only accessors over the host's conversation store.
pub trait ConversationStore: Send + Sync {
    /// The most recent turns in chronological order, at most `limit`.
    fn recent_turns(
        &self,
        persona_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>>;

    fn message_count(&self, persona_id: &str, conversation_id: &str) -> Result<u64>;
}

/// SQLite-backed implementation over the host's `messages` table.
///
/// Opens a fresh connection per call; all statements are reads.
pub struct SqliteConversationStore {
    path: PathBuf,
}

impl SqliteConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("Failed to open conversation store at {:?}", self.path))
    }
}

impl ConversationStore for SqliteConversationStore {
    fn recent_turns(
        &self,
        persona_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT role, content FROM messages
             WHERE persona_id = ?1 AND conversation_id = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;

        let mut turns = stmt
            .query_map(params![persona_id, conversation_id, limit as i64], |row| {
                Ok(ChatTurn {
                    role: row.get(0)?,
                    text: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        turns.reverse();
        Ok(turns)
    }

    fn message_count(&self, persona_id: &str, conversation_id: &str) -> Result<u64> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE persona_id = ?1 AND conversation_id = ?2",
            params![persona_id, conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_store(dir: &std::path::Path) -> SqliteConversationStore {
        let path = dir.join("chat.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            r#"CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                persona_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL
            )"#,
            [],
        )
        .unwrap();

        for (role, content) in [
            ("user", "hello"),
            ("assistant", "hi, good to see you"),
            ("user", "what did we talk about yesterday?"),
            ("assistant", "the aquarium trip"),
        ] {
            conn.execute(
                "INSERT INTO messages (persona_id, conversation_id, role, content)
                 VALUES ('rin', 'main', ?1, ?2)",
                params![role, content],
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO messages (persona_id, conversation_id, role, content)
             VALUES ('other', 'main', 'user', 'unrelated')",
            [],
        )
        .unwrap();

        SqliteConversationStore::new(path)
    }

    #[test]
    fn recent_turns_are_chronological_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed_store(dir.path());

        let turns = store.recent_turns("rin", "main", 2).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].text, "what did we talk about yesterday?");
        assert_eq!(turns[1].text, "the aquarium trip");
    }

    #[test]
    fn counts_are_scoped_to_persona_and_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed_store(dir.path());

        assert_eq!(store.message_count("rin", "main").unwrap(), 4);
        assert_eq!(store.message_count("other", "main").unwrap(), 1);
        assert_eq!(store.message_count("rin", "side").unwrap(), 0);
    }
}
