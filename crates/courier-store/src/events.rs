//! Change notifications emitted by the store.
//!
//! This is the observation interface the UI binds to: a view re-runs its
//! query when an event for the conversation it shows arrives.

use serde::Serialize;

use courier_shared::{ConversationId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreEvent {
    MessageInserted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ConversationChanged {
        conversation_id: ConversationId,
    },
    ConversationDeleted {
        conversation_id: ConversationId,
    },
}

impl StoreEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::MessageInserted { conversation_id, .. }
            | Self::MessageUpdated { conversation_id, .. }
            | Self::MessageDeleted { conversation_id, .. }
            | Self::ConversationChanged { conversation_id }
            | Self::ConversationDeleted { conversation_id } => *conversation_id,
        }
    }
}
