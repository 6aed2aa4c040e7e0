use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, DeliveryStatus, MessageId, UserId};

/// Participant -> time they read a message
pub type ReadReceipts = BTreeMap<UserId, DateTime<Utc>>;

/// A message as exchanged with the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    /// Sender's client clock at creation
    pub local_created_at: DateTime<Utc>,
    /// Assigned by the server on first accept; absent on outbound writes
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Per-conversation sequence number, assigned by the server
    pub sequence: Option<i64>,
    /// Server last-modified time of this record
    pub updated_at: Option<DateTime<Utc>>,
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub read_receipts: ReadReceipts,
    #[serde(default)]
    pub is_system: bool,
}

/// A conversation record as pushed to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub admin_ids: Vec<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Server acknowledgement of an accepted message write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAck {
    pub message_id: MessageId,
    pub server_timestamp: DateTime<Utc>,
    pub sequence: Option<i64>,
}

/// Change notifications delivered by a conversation subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteEvent {
    /// A message was created or rewritten remotely
    MessageUpserted(RemoteMessage),

    /// Delivery progress of an existing message
    StatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        delivery_status: DeliveryStatus,
        read_receipts: ReadReceipts,
        updated_at: DateTime<Utc>,
    },

    /// A message was removed remotely
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// Asynchronous annotation from the enrichment pipeline
    Enriched {
        conversation_id: ConversationId,
        message_id: MessageId,
        metadata: serde_json::Value,
    },
}

impl RemoteEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::MessageUpserted(m) => m.conversation_id,
            Self::StatusChanged { conversation_id, .. }
            | Self::MessageDeleted { conversation_id, .. }
            | Self::Enriched { conversation_id, .. } => *conversation_id,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::MessageUpserted(m) => m.id,
            Self::StatusChanged { message_id, .. }
            | Self::MessageDeleted { message_id, .. }
            | Self::Enriched { message_id, .. } => *message_id,
        }
    }
}
