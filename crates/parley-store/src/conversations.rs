use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::ConversationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const DEFAULT_TITLE: &str = "New Chat";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRow {
    pub id: ConversationId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new conversation. A missing title defaults to "New Chat".
    #[instrument(skip(self))]
    pub fn create(
        &self,
        title: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let title = match title {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => DEFAULT_TITLE.to_string(),
        };
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, owner_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), title, owner_id, now, now],
            )?;

            Ok(ConversationRow {
                id,
                title,
                owner_id: owner_id.map(str::to_string),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a conversation by ID.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, owner_id, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// List all conversations, most recently updated first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, owner_id, created_at, updated_at
                 FROM conversations ORDER BY updated_at DESC, id DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }

    /// Rename a conversation; also bumps its updated_at.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn rename(&self, id: &ConversationId, title: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![title, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    /// Bump updated_at to now. Called after each persisted message.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn touch(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    /// Delete a conversation and all of its messages.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn delete(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [id.as_str()],
            )?;
            let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "conversations",
            "id",
        )?),
        title: row_helpers::get(row, 1, "conversations", "title")?,
        owner_id: row_helpers::get_opt(row, 2, "conversations", "owner_id")?,
        created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 4, "conversations", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ConversationRepo {
        ConversationRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_with_title() {
        let repo = setup();
        let conv = repo.create(Some("Project ideas"), None).unwrap();
        assert!(conv.id.as_str().starts_with("conv_"));
        assert_eq!(conv.title, "Project ideas");
        assert_eq!(conv.created_at, conv.updated_at);
    }

    #[test]
    fn create_defaults_title() {
        let repo = setup();
        let conv = repo.create(None, None).unwrap();
        assert_eq!(conv.title, "New Chat");

        let blank = repo.create(Some("   "), None).unwrap();
        assert_eq!(blank.title, "New Chat");
    }

    #[test]
    fn create_with_owner() {
        let repo = setup();
        let conv = repo.create(Some("Mine"), Some("user-7")).unwrap();
        assert_eq!(conv.owner_id.as_deref(), Some("user-7"));
    }

    #[test]
    fn get_round_trips() {
        let repo = setup();
        let conv = repo.create(Some("Hello"), None).unwrap();
        let fetched = repo.get(&conv.id).unwrap();
        assert_eq!(fetched.id, conv.id);
        assert_eq!(fetched.title, "Hello");
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = setup();
        let result = repo.get(&ConversationId::from_raw("conv_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_orders_by_updated_at_desc() {
        let repo = setup();
        let a = repo.create(Some("a"), None).unwrap();
        let b = repo.create(Some("b"), None).unwrap();

        // Touch the older one so it becomes the most recently updated.
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.touch(&a.id).unwrap();

        let all = repo.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a.id);
        assert_eq!(all[1].id, b.id);
    }

    #[test]
    fn rename_updates_title_and_timestamp() {
        let repo = setup();
        let conv = repo.create(Some("Old"), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.rename(&conv.id, "New").unwrap();

        let fetched = repo.get(&conv.id).unwrap();
        assert_eq!(fetched.title, "New");
        assert!(fetched.updated_at > fetched.created_at);
    }

    #[test]
    fn rename_missing_is_not_found() {
        let repo = setup();
        let result = repo.rename(&ConversationId::new(), "x");
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn touch_bumps_updated_at() {
        let repo = setup();
        let conv = repo.create(None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.touch(&conv.id).unwrap();
        let fetched = repo.get(&conv.id).unwrap();
        assert!(fetched.updated_at > fetched.created_at);
        assert_eq!(fetched.created_at, conv.created_at);
    }

    #[test]
    fn touch_missing_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.touch(&ConversationId::new()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_removes_conversation() {
        let repo = setup();
        let conv = repo.create(None, None).unwrap();
        repo.delete(&conv.id).unwrap();
        assert!(repo.get(&conv.id).is_err());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.delete(&ConversationId::new()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn row_serializes_camel_case() {
        let repo = setup();
        let conv = repo.create(Some("Wire"), None).unwrap();
        let json = serde_json::to_value(&conv).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("ownerId").is_none());
    }
}
