use chrono::Utc;
use tracing::instrument;

use parley_core::chat::{MessageRecord, Role};
use parley_core::ids::{ConversationId, MessageId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one message. Rejected (FK) when the conversation is absent.
    /// Messages are immutable once written; there is no update path.
    #[instrument(skip(self, content), fields(conversation_id = %conversation_id, role = %role))]
    pub fn create(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
        metadata: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, timestamp, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.as_str(),
                    role.to_string(),
                    content,
                    now,
                    metadata,
                ],
            )?;

            Ok(MessageRecord {
                id,
                conversation_id: conversation_id.clone(),
                role,
                content: content.to_string(),
                timestamp: now,
                metadata: metadata.map(str::to_string),
            })
        })
    }

    /// All messages of a conversation, ascending by timestamp.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn list(&self, conversation_id: &ConversationId) -> Result<Vec<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, timestamp, metadata
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// The most recent `limit` messages, returned oldest-first. `exclude`
    /// drops one message id from the window (the turn's own user message,
    /// which the relay appends as the prompt instead).
    #[instrument(skip(self), fields(conversation_id = %conversation_id, limit))]
    pub fn recent_window(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
        exclude: Option<&MessageId>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let excluded = exclude.map(|id| id.as_str().to_string()).unwrap_or_default();
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, timestamp, metadata
                 FROM messages WHERE conversation_id = ?1 AND id <> ?2
                 ORDER BY timestamp DESC, id DESC LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                conversation_id.as_str(),
                excluded,
                limit as i64,
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Number of messages in a conversation.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn count(&self, conversation_id: &ConversationId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let role_str: String = row_helpers::get(row, 2, "messages", "role")?;

    Ok(MessageRecord {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "messages",
            "conversation_id",
        )?),
        role: row_helpers::parse_enum(&role_str, "messages", "role")?,
        content: row_helpers::get(row, 3, "messages", "content")?,
        timestamp: row_helpers::get(row, 4, "messages", "timestamp")?,
        metadata: row_helpers::get_opt(row, 5, "messages", "metadata")?,
    })
}
