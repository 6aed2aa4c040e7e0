use serde::Serialize;

use courier_store::{Conversation, Message, StoreEvent};
use courier_sync::{SyncPhase, SyncSignal, SyncState};

pub const EVENT_MESSAGE_CHANGED: &str = "message-changed";
pub const EVENT_MESSAGE_DELETED: &str = "message-deleted";
pub const EVENT_CONVERSATION_CHANGED: &str = "conversation-changed";
pub const EVENT_CONVERSATION_DELETED: &str = "conversation-deleted";
pub const EVENT_SYNC_STATE_CHANGED: &str = "sync-state-changed";
pub const EVENT_SYNC_SIGNAL: &str = "sync-signal";

/// UI event name for a store change.
pub fn event_name(event: &StoreEvent) -> &'static str {
    match event {
        StoreEvent::MessageInserted { .. } | StoreEvent::MessageUpdated { .. } => {
            EVENT_MESSAGE_CHANGED
        }
        StoreEvent::MessageDeleted { .. } => EVENT_MESSAGE_DELETED,
        StoreEvent::ConversationChanged { .. } => EVENT_CONVERSATION_CHANGED,
        StoreEvent::ConversationDeleted { .. } => EVENT_CONVERSATION_DELETED,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub timestamp: String,
    pub delivery_status: String,
    pub sync_status: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub read_by: Vec<String>,
    pub is_system: bool,
    /// A failed message offers retry and discard.
    pub can_retry: bool,
}

impl From<Message> for MessageDto {
    fn from(m: Message) -> Self {
        let can_retry = m.sync_status == courier_shared::SyncStatus::Failed;
        Self {
            id: m.id.to_string(),
            conversation_id: m.conversation_id.to_string(),
            sender_id: m.sender_id.to_string(),
            timestamp: m
                .server_timestamp
                .unwrap_or(m.local_created_at)
                .to_rfc3339(),
            delivery_status: m.delivery_status.as_str().to_string(),
            sync_status: m.sync_status.as_str().to_string(),
            retry_count: m.retry_count,
            last_error: m.last_sync_error,
            read_by: m.read_receipts.keys().map(|u| u.to_string()).collect(),
            is_system: m.is_system,
            can_retry,
            body: m.body,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDto {
    pub id: String,
    pub participants: Vec<String>,
    pub display_name: Option<String>,
    pub is_group: bool,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<String>,
    pub last_message_sender: Option<String>,
    pub unread_count: u32,
    pub sync_status: String,
}

impl From<Conversation> for ConversationDto {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id.to_string(),
            is_group: c.is_group(),
            participants: c.participants.iter().map(|u| u.to_string()).collect(),
            display_name: c.display_name,
            pinned: c.pinned,
            muted: c.muted,
            archived: c.archived,
            last_message_text: c.last_message_text,
            last_message_at: c.last_message_at.map(|t| t.to_rfc3339()),
            last_message_sender: c.last_message_sender.map(|u| u.to_string()),
            unread_count: c.unread_count,
            sync_status: c.sync_status.as_str().to_string(),
        }
    }
}

/// Drives the "N messages waiting to send" indicator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatePayload {
    pub online: bool,
    pub phase: String,
    pub pending: u32,
    pub failed: u32,
    pub banner: Option<String>,
}

impl From<SyncState> for SyncStatePayload {
    fn from(s: SyncState) -> Self {
        let phase = match s.phase {
            SyncPhase::Offline => "offline",
            SyncPhase::Draining => "draining",
            SyncPhase::Idle => "idle",
        };
        let banner = match (s.pending, s.failed) {
            (0, 0) => None,
            (0, failed) => Some(format!("{failed} message(s) failed to send")),
            (pending, 0) => Some(format!("{pending} message(s) waiting to send")),
            (pending, failed) => Some(format!(
                "{pending} message(s) waiting to send, {failed} failed"
            )),
        };
        Self {
            online: s.online,
            phase: phase.to_string(),
            pending: s.pending,
            failed: s.failed,
            banner,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub conversation_id: String,
    pub description: String,
}

impl From<SyncSignal> for SignalPayload {
    fn from(signal: SyncSignal) -> Self {
        match signal {
            SyncSignal::SequenceGap {
                conversation_id,
                expected,
                received,
            } => Self {
                conversation_id: conversation_id.to_string(),
                description: format!("missed messages: expected #{expected}, got #{received}"),
            },
            SyncSignal::MessageFailed {
                conversation_id,
                message_id,
                reason,
                rejected,
            } => Self {
                conversation_id: conversation_id.to_string(),
                description: if rejected {
                    format!("message {message_id} was rejected: {reason}")
                } else {
                    format!("message {message_id} could not be sent: {reason}")
                },
            },
            SyncSignal::ConversationResynced {
                conversation_id,
                messages,
            } => Self {
                conversation_id: conversation_id.to_string(),
                description: format!("resynced, {messages} message(s) updated"),
            },
        }
    }
}
