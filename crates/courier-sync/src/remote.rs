//! Boundary to the managed remote store.
//!
//! [`RemoteSyncClient`] is the only component allowed to perform network I/O.
//! The concrete protocol (document writes, realtime listeners, auth headers)
//! belongs to the implementation; the core only sees acknowledgements,
//! change events and classified [`DeliveryError`]s.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use courier_shared::protocol::{RemoteConversation, RemoteEvent, RemoteMessage, ServerAck};
use courier_shared::{ConversationId, DeliveryError, MessageId, UserId};

/// Shared handle to the remote client.
pub type RemoteHandle = Arc<dyn RemoteSyncClient>;

#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Write one message. Re-sending the same id is an upsert on the remote
    /// side and returns the acknowledgement of the stored record.
    async fn send(&self, message: &RemoteMessage) -> Result<ServerAck, DeliveryError>;

    /// Write a conversation record. Idempotent by conversation id.
    async fn create_conversation(
        &self,
        conversation: &RemoteConversation,
    ) -> Result<(), DeliveryError>;

    /// Open a standing subscription to a conversation's change events.
    /// Dropping the receiver cancels the subscription.
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> Result<mpsc::Receiver<RemoteEvent>, DeliveryError>;

    /// Every message the remote store holds for a conversation.
    async fn fetch_history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<RemoteMessage>, DeliveryError>;

    /// Publish that `reader` has read the given messages.
    async fn send_read_receipt(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
        reader: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<(), DeliveryError>;
}
