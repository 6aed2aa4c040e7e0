//! CRUD operations for [`Conversation`] records.

use rusqlite::{params, OptionalExtension, Transaction};

use courier_shared::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::models::Conversation;
use crate::sql::{json_at, opt_millis, opt_ts_at, opt_uuid_at, parsed_at, to_millis, ts_at, uuid_at};

const CONVERSATION_COLUMNS: &str = "id, participants, display_name, avatar_ref, admin_ids,
     pinned, muted, archived, last_message_id, last_message_text, last_message_at,
     last_message_sender, unread_count, created_by, created_at, sync_status,
     retry_count, last_sync_attempt, last_sync_error, highest_sequence, sequence_gap";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new conversation.
    pub fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversations ({CONVERSATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                             ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
                ),
                params![
                    conversation.id.to_string(),
                    serde_json::to_string(&conversation.participants)?,
                    conversation.display_name,
                    conversation.avatar_ref,
                    serde_json::to_string(&conversation.admin_ids)?,
                    conversation.pinned,
                    conversation.muted,
                    conversation.archived,
                    conversation.last_message_id.map(|id| id.to_string()),
                    conversation.last_message_text,
                    opt_millis(conversation.last_message_at),
                    conversation.last_message_sender.as_ref().map(UserId::as_str),
                    conversation.unread_count,
                    conversation.created_by.as_str(),
                    to_millis(conversation.created_at),
                    conversation.sync_status.as_str(),
                    conversation.retry_count,
                    opt_millis(conversation.last_sync_attempt),
                    conversation.last_sync_error,
                    conversation.highest_sequence,
                    conversation.sequence_gap,
                ],
            )
            .map_err(|e| StoreError::from_insert(e, conversation.id))?;

        self.notify(StoreEvent::ConversationChanged {
            conversation_id: conversation.id,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.find_conversation(id)?.ok_or(StoreError::NotFound)
    }

    /// Fetch a single conversation by id, `None` if it does not exist.
    pub fn find_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .optional()?)
    }

    /// List conversations, pinned first, then by most recent activity.
    /// Archived conversations are only included on request.
    pub fn list_conversations(&self, include_archived: bool) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             WHERE archived = 0 OR ?1
             ORDER BY pinned DESC, COALESCE(last_message_at, created_at) DESC, id ASC"
        ))?;

        let rows = stmt.query_map(params![include_archived], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Conversations created locally and not yet accepted by the remote store.
    pub fn pending_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             WHERE sync_status = 'pending'
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a field-level mutation atomically.  Identity and creation
    /// fields are restored after `mutate`, and the highest seen sequence
    /// number never decreases.
    pub fn update_conversation<F>(&mut self, id: ConversationId, mutate: F) -> Result<Conversation>
    where
        F: FnOnce(&mut Conversation),
    {
        let tx = self.conn_mut().transaction()?;

        let before = tx
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(StoreError::from_lookup)?;

        let mut after = before.clone();
        mutate(&mut after);
        after.id = before.id;
        after.created_by = before.created_by.clone();
        after.created_at = before.created_at;
        after.highest_sequence = match (before.highest_sequence, after.highest_sequence) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };

        if after == before {
            tx.commit()?;
            return Ok(after);
        }

        write_conversation(&tx, &after)?;
        tx.commit()?;

        self.notify(StoreEvent::ConversationChanged { conversation_id: id });
        Ok(after)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Hard-delete a conversation and, through the foreign key, all of its
    /// messages.  Returns `true` if a row was deleted.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;

        if affected > 0 {
            self.notify(StoreEvent::ConversationDeleted { conversation_id: id });
        }
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_conversation(tx: &Transaction<'_>, c: &Conversation) -> Result<()> {
    tx.execute(
        "UPDATE conversations SET
             participants = ?2, display_name = ?3, avatar_ref = ?4, admin_ids = ?5,
             pinned = ?6, muted = ?7, archived = ?8,
             last_message_id = ?9, last_message_text = ?10, last_message_at = ?11,
             last_message_sender = ?12, unread_count = ?13,
             sync_status = ?14, retry_count = ?15, last_sync_attempt = ?16,
             last_sync_error = ?17, highest_sequence = ?18, sequence_gap = ?19
         WHERE id = ?1",
        params![
            c.id.to_string(),
            serde_json::to_string(&c.participants)?,
            c.display_name,
            c.avatar_ref,
            serde_json::to_string(&c.admin_ids)?,
            c.pinned,
            c.muted,
            c.archived,
            c.last_message_id.map(|id| id.to_string()),
            c.last_message_text,
            opt_millis(c.last_message_at),
            c.last_message_sender.as_ref().map(UserId::as_str),
            c.unread_count,
            c.sync_status.as_str(),
            c.retry_count,
            opt_millis(c.last_sync_attempt),
            c.last_sync_error,
            c.highest_sequence,
            c.sequence_gap,
        ],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` (selected with `CONVERSATION_COLUMNS`) to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let last_sender: Option<String> = row.get(11)?;
    let created_by: String = row.get(13)?;

    Ok(Conversation {
        id: ConversationId(uuid_at(row, 0)?),
        participants: json_at(row, 1)?,
        display_name: row.get(2)?,
        avatar_ref: row.get(3)?,
        admin_ids: json_at(row, 4)?,
        pinned: row.get(5)?,
        muted: row.get(6)?,
        archived: row.get(7)?,
        last_message_id: opt_uuid_at(row, 8)?.map(MessageId),
        last_message_text: row.get(9)?,
        last_message_at: opt_ts_at(row, 10)?,
        last_message_sender: last_sender.map(UserId),
        unread_count: row.get(12)?,
        created_by: UserId(created_by),
        created_at: ts_at(row, 14)?,
        sync_status: parsed_at(row, 15)?,
        retry_count: row.get(16)?,
        last_sync_attempt: opt_ts_at(row, 17)?,
        last_sync_error: row.get(18)?,
        highest_sequence: row.get(19)?,
        sequence_gap: row.get(20)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use chrono::{DateTime, Utc};
    use courier_shared::types::from_millis;
    use courier_shared::SyncStatus;

    fn at(ms: i64) -> DateTime<Utc> {
        from_millis(ms).unwrap()
    }

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn new_conversation(created_at: i64) -> Conversation {
        Conversation::new(UserId::from("alice"), vec![UserId::from("bob")], at(created_at)).unwrap()
    }

    #[test]
    fn create_and_get_round_trip() {
        let (_dir, db) = open();
        let mut c = Conversation::new(
            UserId::from("alice"),
            vec![UserId::from("bob"), UserId::from("carol")],
            at(5),
        )
        .unwrap();
        c.display_name = Some("Trip".into());

        db.create_conversation(&c).unwrap();
        assert_eq!(db.get_conversation(c.id).unwrap(), c);
        assert!(matches!(db.create_conversation(&c), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn listing_hides_archived_and_puts_pinned_first() {
        let (_dir, mut db) = open();
        let old = new_conversation(1);
        let newer = new_conversation(2);
        let archived = new_conversation(3);
        for c in [&old, &newer, &archived] {
            db.create_conversation(c).unwrap();
        }

        db.update_conversation(archived.id, |c| c.archived = true).unwrap();
        let ids: Vec<ConversationId> =
            db.list_conversations(false).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![newer.id, old.id]);

        db.update_conversation(old.id, |c| c.pinned = true).unwrap();
        let ids: Vec<ConversationId> =
            db.list_conversations(true).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![old.id, archived.id, newer.id]);
    }

    #[test]
    fn highest_sequence_never_decreases() {
        let (_dir, mut db) = open();
        let c = new_conversation(1);
        db.create_conversation(&c).unwrap();

        db.update_conversation(c.id, |c| c.highest_sequence = Some(5)).unwrap();
        let after = db
            .update_conversation(c.id, |c| c.highest_sequence = Some(3))
            .unwrap();
        assert_eq!(after.highest_sequence, Some(5));
    }

    #[test]
    fn pending_conversations_excludes_synced() {
        let (_dir, mut db) = open();
        let a = new_conversation(1);
        let b = new_conversation(2);
        db.create_conversation(&a).unwrap();
        db.create_conversation(&b).unwrap();
        db.update_conversation(a.id, |c| c.sync_status = SyncStatus::Synced)
            .unwrap();

        let pending: Vec<ConversationId> =
            db.pending_conversations().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(pending, vec![b.id]);
    }

    #[test]
    fn delete_cascades_to_messages() {
        let (_dir, db) = open();
        let c = new_conversation(1);
        db.create_conversation(&c).unwrap();
        let m = Message::outgoing(c.id, UserId::from("alice"), "hi", at(2), 3).unwrap();
        db.insert_message(&m).unwrap();

        assert!(db.delete_conversation(c.id).unwrap());
        assert!(db.find_message(m.id).unwrap().is_none());
        assert!(db.find_conversation(c.id).unwrap().is_none());
        assert!(!db.delete_conversation(c.id).unwrap());
    }
}
