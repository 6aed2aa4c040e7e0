//! CRUD operations for [`Message`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use courier_shared::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::models::{Message, SyncCounts};
use crate::sql::{
    json_at, opt_json_at, opt_millis, opt_ts_at, parsed_at, to_millis, ts_at, uuid_at,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, local_created_at,
     server_timestamp, sequence, remote_version, delivery_status, sync_status,
     retry_count, attempt_ceiling, rejected, last_sync_attempt, last_sync_error,
     read_receipts, is_system, enrichment";

/// Display order; see [`crate::models::OrderKey`].
const DISPLAY_ORDER: &str = "local_created_at ASC,
     (server_timestamp IS NULL) ASC, server_timestamp ASC,
     (sequence IS NULL) ASC, sequence ASC,
     id ASC";

/// Newest first; see [`crate::models::RecencyKey`].
const RECENCY_ORDER_DESC: &str = "COALESCE(server_timestamp, local_created_at) DESC,
     local_created_at DESC,
     (server_timestamp IS NULL) DESC, server_timestamp DESC,
     (sequence IS NULL) DESC, sequence DESC,
     id DESC";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message.
    ///
    /// The write is committed and announced to observers before this returns.
    /// Inserting an id that already exists fails with
    /// [`StoreError::Duplicate`].
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.as_str(),
                    message.body,
                    to_millis(message.local_created_at),
                    opt_millis(message.server_timestamp),
                    message.sequence,
                    opt_millis(message.remote_version),
                    message.delivery_status.as_str(),
                    message.sync_status.as_str(),
                    message.retry_count,
                    message.attempt_ceiling,
                    message.rejected,
                    opt_millis(message.last_sync_attempt),
                    message.last_sync_error,
                    serde_json::to_string(&message.read_receipts)?,
                    message.is_system,
                    message
                        .enrichment
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .map_err(|e| StoreError::from_insert(e, message.id))?;

        self.notify(StoreEvent::MessageInserted {
            conversation_id: message.conversation_id,
            message_id: message.id,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.find_message(id)?.ok_or(StoreError::NotFound)
    }

    /// Fetch a single message by id, `None` if it does not exist.
    pub fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?)
    }

    /// All messages of a conversation in display order: local creation time,
    /// then server timestamp, then sequence number.
    pub fn messages_for_conversation(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY {DISPLAY_ORDER}"
        ))?;

        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The newest message of a conversation by recency key.
    pub fn latest_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY {RECENCY_ORDER_DESC}
                     LIMIT 1"
                ),
                params![conversation_id.to_string()],
                row_to_message,
            )
            .optional()?)
    }

    /// Messages eligible for an automatic delivery attempt, oldest first.
    pub fn deliverable_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE is_system = 0
               AND (sync_status = 'pending'
                    OR (sync_status = 'failed' AND rejected = 0 AND retry_count < attempt_ceiling))
             ORDER BY local_created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map([], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Pending and failed message counts across all conversations.
    pub fn sync_counts(&self) -> Result<SyncCounts> {
        let (pending, failed): (u32, u32) = self.conn().query_row(
            "SELECT
                 COALESCE(SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN sync_status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM messages
             WHERE is_system = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(SyncCounts { pending, failed })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a field-level mutation atomically.
    ///
    /// The read, the mutation and the write happen in one transaction, so no
    /// reader observes a half-updated record.  Fields that must never change
    /// once set are restored after `mutate` runs: id, conversation, local
    /// creation time, an assigned sequence number, and a retry count that
    /// would decrease.
    pub fn update_message<F>(&mut self, id: MessageId, mutate: F) -> Result<Message>
    where
        F: FnOnce(&mut Message),
    {
        let tx = self.conn_mut().transaction()?;

        let before = tx
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(StoreError::from_lookup)?;

        let mut after = before.clone();
        mutate(&mut after);
        keep_immutable_fields(&before, &mut after);

        if after == before {
            tx.commit()?;
            return Ok(after);
        }

        write_message(&tx, &after)?;
        tx.commit()?;

        self.notify(StoreEvent::MessageUpdated {
            conversation_id: after.conversation_id,
            message_id: after.id,
        });
        Ok(after)
    }

    /// Record that `reader` has read every message from other senders in the
    /// conversation.  Returns the ids that were newly marked.
    pub fn mark_read_by(
        &mut self,
        conversation_id: ConversationId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let tx = self.conn_mut().transaction()?;

        let unread: Vec<Message> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_system = 0"
            ))?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), reader.as_str()],
                row_to_message,
            )?;
            let mut out = Vec::new();
            for row in rows {
                let message = row?;
                if !message.read_receipts.contains_key(reader) {
                    out.push(message);
                }
            }
            out
        };

        let mut marked = Vec::with_capacity(unread.len());
        for mut message in unread {
            message.read_receipts.insert(reader.clone(), at);
            tx.execute(
                "UPDATE messages SET read_receipts = ?1 WHERE id = ?2",
                params![
                    serde_json::to_string(&message.read_receipts)?,
                    message.id.to_string()
                ],
            )?;
            marked.push(message.id);
        }
        tx.commit()?;

        for message_id in &marked {
            self.notify(StoreEvent::MessageUpdated {
                conversation_id,
                message_id: *message_id,
            });
        }
        Ok(marked)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a message by id.  Returns `true` if a row was deleted.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let conversation: Option<String> = self
            .conn()
            .query_row(
                "DELETE FROM messages WHERE id = ?1 RETURNING conversation_id",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match conversation {
            Some(conversation) => {
                let conversation_id: ConversationId = conversation.parse()?;
                self.notify(StoreEvent::MessageDeleted {
                    conversation_id,
                    message_id: id,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn keep_immutable_fields(before: &Message, after: &mut Message) {
    after.id = before.id;
    after.conversation_id = before.conversation_id;
    after.local_created_at = before.local_created_at;
    after.is_system = before.is_system;
    if before.sequence.is_some() && after.sequence != before.sequence {
        tracing::warn!(msg_id = %before.id, "ignoring attempt to reassign sequence number");
        after.sequence = before.sequence;
    }
    if after.retry_count < before.retry_count {
        after.retry_count = before.retry_count;
    }
}

fn write_message(tx: &Transaction<'_>, message: &Message) -> Result<()> {
    tx.execute(
        "UPDATE messages SET
             sender_id = ?2, body = ?3, server_timestamp = ?4, sequence = ?5,
             remote_version = ?6, delivery_status = ?7, sync_status = ?8,
             retry_count = ?9, attempt_ceiling = ?10, rejected = ?11,
             last_sync_attempt = ?12, last_sync_error = ?13,
             read_receipts = ?14, enrichment = ?15
         WHERE id = ?1",
        params![
            message.id.to_string(),
            message.sender_id.as_str(),
            message.body,
            opt_millis(message.server_timestamp),
            message.sequence,
            opt_millis(message.remote_version),
            message.delivery_status.as_str(),
            message.sync_status.as_str(),
            message.retry_count,
            message.attempt_ceiling,
            message.rejected,
            opt_millis(message.last_sync_attempt),
            message.last_sync_error,
            serde_json::to_string(&message.read_receipts)?,
            message
                .enrichment
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        ],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` (selected with `MESSAGE_COLUMNS`) to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let sender: String = row.get(2)?;
    Ok(Message {
        id: MessageId(uuid_at(row, 0)?),
        conversation_id: ConversationId(uuid_at(row, 1)?),
        sender_id: UserId(sender),
        body: row.get(3)?,
        local_created_at: ts_at(row, 4)?,
        server_timestamp: opt_ts_at(row, 5)?,
        sequence: row.get(6)?,
        remote_version: opt_ts_at(row, 7)?,
        delivery_status: parsed_at(row, 8)?,
        sync_status: parsed_at(row, 9)?,
        retry_count: row.get(10)?,
        attempt_ceiling: row.get(11)?,
        rejected: row.get(12)?,
        last_sync_attempt: opt_ts_at(row, 13)?,
        last_sync_error: row.get(14)?,
        read_receipts: json_at(row, 15)?,
        is_system: row.get(16)?,
        enrichment: opt_json_at(row, 17)?,
    })
}
