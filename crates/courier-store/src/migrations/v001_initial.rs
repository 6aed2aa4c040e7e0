//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `conversations` and `messages`.  Timestamps
//! are integer milliseconds since the Unix epoch so they sort numerically.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                  TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    participants        TEXT NOT NULL,               -- JSON array of user ids
    display_name        TEXT,
    avatar_ref          TEXT,
    admin_ids           TEXT NOT NULL DEFAULT '[]',  -- JSON array of user ids
    pinned              INTEGER NOT NULL DEFAULT 0,
    muted               INTEGER NOT NULL DEFAULT 0,
    archived            INTEGER NOT NULL DEFAULT 0,
    last_message_id     TEXT,
    last_message_text   TEXT,
    last_message_at     INTEGER,
    last_message_sender TEXT,
    unread_count        INTEGER NOT NULL DEFAULT 0,
    created_by          TEXT NOT NULL,
    created_at          INTEGER NOT NULL,
    sync_status         TEXT NOT NULL DEFAULT 'pending',
    retry_count         INTEGER NOT NULL DEFAULT 0,
    last_sync_attempt   INTEGER,
    last_sync_error     TEXT,
    highest_sequence    INTEGER,                     -- highest server sequence seen
    sequence_gap        INTEGER NOT NULL DEFAULT 0   -- boolean 0/1, cleared by a resync
);

CREATE INDEX IF NOT EXISTS idx_conversations_sync_status
    ON conversations(sync_status);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4, client generated
    conversation_id   TEXT NOT NULL,              -- FK -> conversations(id)
    sender_id         TEXT NOT NULL,
    body              TEXT NOT NULL,
    local_created_at  INTEGER NOT NULL,
    server_timestamp  INTEGER,
    sequence          INTEGER,
    remote_version    INTEGER,
    delivery_status   TEXT NOT NULL,
    sync_status       TEXT NOT NULL,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    attempt_ceiling   INTEGER NOT NULL,
    rejected          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    last_sync_attempt INTEGER,
    last_sync_error   TEXT,
    read_receipts     TEXT NOT NULL DEFAULT '{}', -- JSON object
    is_system         INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    enrichment        TEXT,                       -- JSON, optional

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
    ON messages(conversation_id, local_created_at, server_timestamp, sequence);

CREATE INDEX IF NOT EXISTS idx_messages_sync_status
    ON messages(sync_status, local_created_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
