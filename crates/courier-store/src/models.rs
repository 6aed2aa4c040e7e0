//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::constants::{MAX_BODY_LEN, MIN_PARTICIPANTS};
use courier_shared::protocol::{ReadReceipts, RemoteConversation, RemoteMessage};
use courier_shared::{
    ConversationId, DeliveryStatus, MessageId, SyncStatus, UserId, ValidationError,
};

/// Sender recorded on system-generated messages.
pub const SYSTEM_SENDER: &str = "system";

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A conversation between two or more participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Distinct participant ids, creator first.
    pub participants: Vec<UserId>,
    /// Group display name (groups only).
    pub display_name: Option<String>,
    /// Group avatar reference (groups only).
    pub avatar_ref: Option<String>,
    /// Group administrators (groups only).
    pub admin_ids: Vec<UserId>,
    pub pinned: bool,
    pub muted: bool,
    /// Soft-deleted: hidden from the default listing.
    pub archived: bool,

    // Denormalized from the newest message, for list rendering.
    pub last_message_id: Option<MessageId>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_sender: Option<UserId>,
    pub unread_count: u32,

    pub created_by: UserId,
    pub created_at: DateTime<Utc>,

    // Delivery of the conversation record itself.
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,

    /// Highest server sequence number seen in this conversation.
    pub highest_sequence: Option<i64>,
    /// Set when a sequence gap was observed and not yet resolved by a resync.
    pub sequence_gap: bool,
}

impl Conversation {
    /// A new, not yet synced conversation created by `created_by`.
    ///
    /// The creator is always a participant; duplicates are dropped.
    pub fn new(
        created_by: UserId,
        participants: impl IntoIterator<Item = UserId>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let mut members = vec![created_by.clone()];
        for p in participants {
            if !members.contains(&p) {
                members.push(p);
            }
        }
        if members.len() < MIN_PARTICIPANTS {
            return Err(ValidationError::TooFewParticipants {
                got: members.len(),
                min: MIN_PARTICIPANTS,
            });
        }

        let admin_ids = if members.len() > 2 {
            vec![created_by.clone()]
        } else {
            Vec::new()
        };

        Ok(Self {
            id: ConversationId::new(),
            participants: members,
            display_name: None,
            avatar_ref: None,
            admin_ids,
            pinned: false,
            muted: false,
            archived: false,
            last_message_id: None,
            last_message_text: None,
            last_message_at: None,
            last_message_sender: None,
            unread_count: 0,
            created_by,
            created_at,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_sync_attempt: None,
            last_sync_error: None,
            highest_sequence: None,
            sequence_gap: false,
        })
    }

    /// A conversation that already exists remotely (e.g. seeded from a
    /// fetch); it is stored as synced.
    pub fn from_remote(remote: &RemoteConversation) -> Self {
        Self {
            id: remote.id,
            participants: remote.participants.clone(),
            display_name: remote.display_name.clone(),
            avatar_ref: remote.avatar_ref.clone(),
            admin_ids: remote.admin_ids.clone(),
            pinned: false,
            muted: false,
            archived: false,
            last_message_id: None,
            last_message_text: None,
            last_message_at: None,
            last_message_sender: None,
            unread_count: 0,
            created_by: remote.created_by.clone(),
            created_at: remote.created_at,
            sync_status: SyncStatus::Synced,
            retry_count: 0,
            last_sync_attempt: None,
            last_sync_error: None,
            highest_sequence: None,
            sequence_gap: false,
        }
    }

    pub fn to_remote(&self) -> RemoteConversation {
        RemoteConversation {
            id: self.id,
            participants: self.participants.clone(),
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
            admin_ids: self.admin_ids.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
        }
    }

    pub fn is_group(&self) -> bool {
        self.participants.len() > 2
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Copy the preview fields from `latest`, or clear them.
    pub fn set_last_message(&mut self, latest: Option<&Message>) {
        self.last_message_id = latest.map(|m| m.id);
        self.last_message_text = latest.map(|m| m.body.clone());
        self.last_message_at = latest.map(|m| m.recency_key().effective);
        self.last_message_sender = latest.map(|m| m.sender_id.clone());
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Client-generated identifier, never reassigned.
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    /// Client clock at creation. Set once, used for immediate ordering.
    pub local_created_at: DateTime<Utc>,
    /// Authoritative ordering key, once the server has accepted the write.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Server-assigned per-conversation sequence number. Never changes once set.
    pub sequence: Option<i64>,
    /// Server last-modified time; the last-write-wins comparison key.
    pub remote_version: Option<DateTime<Utc>>,
    pub delivery_status: DeliveryStatus,
    pub sync_status: SyncStatus,
    /// Failed delivery attempts so far. Never decreases.
    pub retry_count: u32,
    /// Automatic delivery stops once `retry_count` reaches this value.
    pub attempt_ceiling: u32,
    /// The last failure was a permanent rejection.
    pub rejected: bool,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub read_receipts: ReadReceipts,
    pub is_system: bool,
    /// Optional annotation from the enrichment pipeline.
    pub enrichment: Option<serde_json::Value>,
}

impl Message {
    /// A message the local user just submitted: `sending` / `pending`.
    pub fn outgoing(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
        attempt_ceiling: u32,
    ) -> Result<Self, ValidationError> {
        let body = body.into();
        validate_body(&body)?;

        Ok(Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            body,
            local_created_at: created_at,
            server_timestamp: None,
            sequence: None,
            remote_version: None,
            delivery_status: DeliveryStatus::Sending,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            attempt_ceiling,
            rejected: false,
            last_sync_attempt: None,
            last_sync_error: None,
            read_receipts: ReadReceipts::new(),
            is_system: false,
            enrichment: None,
        })
    }

    /// A system-generated notice. Considered synced from the start and never
    /// handed to the outbound queue.
    pub fn system(
        conversation_id: ConversationId,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id: UserId::from(SYSTEM_SENDER),
            body: body.into(),
            local_created_at: created_at,
            server_timestamp: None,
            sequence: None,
            remote_version: None,
            delivery_status: DeliveryStatus::Sent,
            sync_status: SyncStatus::Synced,
            retry_count: 0,
            attempt_ceiling: 0,
            rejected: false,
            last_sync_attempt: None,
            last_sync_error: None,
            read_receipts: ReadReceipts::new(),
            is_system: true,
            enrichment: None,
        }
    }

    /// A message first learned about from the remote store.
    pub fn from_remote(remote: &RemoteMessage) -> Self {
        Self {
            id: remote.id,
            conversation_id: remote.conversation_id,
            sender_id: remote.sender_id.clone(),
            body: remote.body.clone(),
            local_created_at: remote.local_created_at,
            server_timestamp: remote.server_timestamp,
            sequence: remote.sequence,
            remote_version: remote.updated_at.or(remote.server_timestamp),
            delivery_status: remote.delivery_status.max(DeliveryStatus::Sent),
            sync_status: SyncStatus::Synced,
            retry_count: 0,
            attempt_ceiling: 0,
            rejected: false,
            last_sync_attempt: None,
            last_sync_error: None,
            read_receipts: remote.read_receipts.clone(),
            is_system: remote.is_system,
            enrichment: None,
        }
    }

    /// The outbound wire form of this message.
    pub fn to_remote(&self) -> RemoteMessage {
        RemoteMessage {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            local_created_at: self.local_created_at,
            server_timestamp: self.server_timestamp,
            sequence: self.sequence,
            updated_at: self.remote_version,
            delivery_status: self.delivery_status,
            read_receipts: self.read_receipts.clone(),
            is_system: self.is_system,
        }
    }

    /// Eligible for an automatic delivery attempt.
    pub fn is_deliverable(&self) -> bool {
        if self.is_system {
            return false;
        }
        match self.sync_status {
            SyncStatus::Pending => true,
            SyncStatus::Failed => !self.rejected && self.retry_count < self.attempt_ceiling,
            SyncStatus::Synced => false,
        }
    }

    /// The automatic retry budget is used up.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.attempt_ceiling
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            local_created_at: self.local_created_at,
            server_timestamp: self.server_timestamp,
            sequence: self.sequence,
            id: self.id,
        }
    }

    pub fn recency_key(&self) -> RecencyKey {
        RecencyKey {
            effective: self.server_timestamp.unwrap_or(self.local_created_at),
            order: self.order_key(),
        }
    }
}

pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    if body.len() > MAX_BODY_LEN {
        return Err(ValidationError::BodyTooLong {
            len: body.len(),
            max: MAX_BODY_LEN,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Display order within a conversation: local creation time, then server
/// timestamp, then sequence number, ascending. A missing server timestamp or
/// sequence sorts after a present one; the id settles exact ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub local_created_at: DateTime<Utc>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub sequence: Option<i64>,
    pub id: MessageId,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.local_created_at
            .cmp(&other.local_created_at)
            .then_with(|| nulls_last(&self.server_timestamp, &other.server_timestamp))
            .then_with(|| nulls_last(&self.sequence, &other.sequence))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Which message is "newest" for conversation previews: server timestamp,
/// falling back to the local timestamp while unacknowledged, then the
/// display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecencyKey {
    pub effective: DateTime<Utc>,
    pub order: OrderKey,
}

fn nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Messages still waiting for the remote store, for the "N messages waiting
/// to send" indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub pending: u32,
    pub failed: u32,
}
