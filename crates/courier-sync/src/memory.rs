//! In-process loopback implementation of the remote store.
//!
//! Behaves like the managed backend as far as the sync core can tell:
//! message writes are upserts keyed by message id, the server assigns
//! timestamps and per-conversation sequence numbers, subscribers receive
//! change events, and a small gatekeeper rejects writes it would never
//! accept.  Failures can be scripted and reachability switched off, which
//! makes it the backend of choice for the demo binary and the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_shared::constants::{MAX_BODY_LEN, SUBSCRIPTION_BUFFER};
use courier_shared::protocol::{RemoteConversation, RemoteEvent, RemoteMessage, ServerAck};
use courier_shared::types::from_millis;
use courier_shared::{
    ConversationId, DeliveryError, DeliveryStatus, MessageId, RejectionKind, UserId,
};

use crate::remote::RemoteSyncClient;

#[derive(Default)]
struct Inner {
    unreachable: bool,
    stalled: bool,
    conversations: HashMap<ConversationId, RemoteConversation>,
    /// Messages per conversation, in acceptance order.
    messages: HashMap<ConversationId, Vec<RemoteMessage>>,
    next_sequence: HashMap<ConversationId, i64>,
    last_timestamp_ms: i64,
    subscribers: HashMap<ConversationId, Vec<mpsc::Sender<RemoteEvent>>>,
    scripted_failures: VecDeque<DeliveryError>,
    send_calls: usize,
}

impl Inner {
    /// Strictly increasing server clock.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        self.last_timestamp_ms = now.max(self.last_timestamp_ms + 1);
        from_millis(self.last_timestamp_ms).unwrap_or_else(Utc::now)
    }

    fn find(&self, conversation_id: ConversationId, id: MessageId) -> Option<&RemoteMessage> {
        self.messages
            .get(&conversation_id)
            .and_then(|list| list.iter().find(|m| m.id == id))
    }

    fn find_mut(
        &mut self,
        conversation_id: ConversationId,
        id: MessageId,
    ) -> Option<&mut RemoteMessage> {
        self.messages
            .get_mut(&conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == id))
    }

    fn accept(&mut self, message: &RemoteMessage) -> Result<ServerAck, DeliveryError> {
        if let Some(existing) = self.find(message.conversation_id, message.id) {
            debug!(msg_id = %message.id, "duplicate write, returning stored ack");
            return Ok(ack_for(existing));
        }

        if !self.conversations.contains_key(&message.conversation_id) {
            return Err(DeliveryError::rejected(
                RejectionKind::PermissionDenied,
                "conversation does not exist",
            ));
        }
        if message.body.len() > MAX_BODY_LEN {
            return Err(DeliveryError::rejected(
                RejectionKind::TooLarge,
                format!("body of {} bytes exceeds {MAX_BODY_LEN}", message.body.len()),
            ));
        }
        if message.body.trim().is_empty() {
            return Err(DeliveryError::rejected(RejectionKind::Malformed, "empty body"));
        }

        let server_timestamp = self.next_timestamp();
        let sequence = {
            let next = self.next_sequence.entry(message.conversation_id).or_insert(1);
            let assigned = *next;
            *next += 1;
            assigned
        };

        let stored = RemoteMessage {
            server_timestamp: Some(server_timestamp),
            sequence: Some(sequence),
            updated_at: Some(server_timestamp),
            delivery_status: message.delivery_status.max(DeliveryStatus::Sent),
            ..message.clone()
        };
        let ack = ack_for(&stored);

        self.messages
            .entry(message.conversation_id)
            .or_default()
            .push(stored.clone());
        self.broadcast(RemoteEvent::MessageUpserted(stored));

        Ok(ack)
    }

    fn broadcast(&mut self, event: RemoteEvent) {
        let Some(subscribers) = self.subscribers.get_mut(&event.conversation_id()) else {
            return;
        };
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conversation = %event.conversation_id(), "subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn ack_for(message: &RemoteMessage) -> ServerAck {
    ServerAck {
        message_id: message.id,
        server_timestamp: message.server_timestamp.unwrap_or(message.local_created_at),
        sequence: message.sequence,
    }
}

fn unreachable() -> DeliveryError {
    DeliveryError::Unreachable("remote store is not reachable".into())
}

/// Loopback remote store.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Simulate the backend being reachable or not.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Make sends hang until the caller gives up.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Fail the next sends with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = DeliveryError>) {
        self.lock().scripted_failures.extend(errors);
    }

    /// Number of `send` calls received so far, failed ones included.
    pub fn send_calls(&self) -> usize {
        self.lock().send_calls
    }

    /// Messages stored for a conversation, in acceptance order.
    pub fn messages(&self, conversation_id: ConversationId) -> Vec<RemoteMessage> {
        self.lock()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<RemoteConversation> {
        self.lock().conversations.get(&conversation_id).cloned()
    }

    /// Live subscriptions on a conversation.
    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(&conversation_id) {
            Some(list) => {
                list.retain(|tx| !tx.is_closed());
                list.len()
            }
            None => 0,
        }
    }

    /// Store a conversation created elsewhere.
    pub fn seed_conversation(&self, conversation: RemoteConversation) {
        self.lock().conversations.insert(conversation.id, conversation);
    }

    /// A write from another participant's device.
    pub fn deliver_from_peer(&self, message: RemoteMessage) -> Result<ServerAck, DeliveryError> {
        self.lock().accept(&message)
    }

    /// Advance a message's delivery status, optionally recording a reader.
    pub fn update_status(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
        reader: Option<(UserId, DateTime<Utc>)>,
    ) -> Option<RemoteEvent> {
        let mut inner = self.lock();
        let updated_at = inner.next_timestamp();
        let message = inner.find_mut(conversation_id, message_id)?;

        message.delivery_status = message.delivery_status.max(status);
        if let Some((reader, at)) = reader {
            message.read_receipts.insert(reader, at);
        }
        message.updated_at = Some(updated_at);

        let event = RemoteEvent::StatusChanged {
            conversation_id,
            message_id,
            delivery_status: message.delivery_status,
            read_receipts: message.read_receipts.clone(),
            updated_at,
        };
        inner.broadcast(event.clone());
        Some(event)
    }

    /// Attach enrichment metadata, as the annotation pipeline would.
    pub fn enrich(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        metadata: serde_json::Value,
    ) {
        self.lock().broadcast(RemoteEvent::Enriched {
            conversation_id,
            message_id,
            metadata,
        });
    }

    /// Remove a message and tell subscribers.
    pub fn delete_message(&self, conversation_id: ConversationId, message_id: MessageId) -> bool {
        let mut inner = self.lock();
        let removed = match inner.messages.get_mut(&conversation_id) {
            Some(list) => {
                let before = list.len();
                list.retain(|m| m.id != message_id);
                list.len() != before
            }
            None => false,
        };
        if removed {
            inner.broadcast(RemoteEvent::MessageDeleted {
                conversation_id,
                message_id,
            });
        }
        removed
    }

    /// Push an arbitrary event to subscribers without touching stored state.
    pub fn emit(&self, event: RemoteEvent) {
        self.lock().broadcast(event);
    }
}

#[async_trait]
impl RemoteSyncClient for MemoryRemote {
    async fn send(&self, message: &RemoteMessage) -> Result<ServerAck, DeliveryError> {
        let stalled = {
            let mut inner = self.lock();
            inner.send_calls += 1;
            if inner.unreachable {
                return Err(unreachable());
            }
            if let Some(err) = inner.scripted_failures.pop_front() {
                return Err(err);
            }
            inner.stalled
        };

        if stalled {
            std::future::pending::<()>().await;
        }

        self.lock().accept(message)
    }

    async fn create_conversation(
        &self,
        conversation: &RemoteConversation,
    ) -> Result<(), DeliveryError> {
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(unreachable());
        }
        inner
            .conversations
            .entry(conversation.id)
            .or_insert_with(|| conversation.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> Result<mpsc::Receiver<RemoteEvent>, DeliveryError> {
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(unreachable());
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        inner.subscribers.entry(conversation_id).or_default().push(tx);
        Ok(rx)
    }

    async fn fetch_history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<RemoteMessage>, DeliveryError> {
        let inner = self.lock();
        if inner.unreachable {
            return Err(unreachable());
        }
        Ok(inner
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_read_receipt(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
        reader: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        if self.lock().unreachable {
            return Err(unreachable());
        }
        for id in message_ids {
            self.update_status(
                conversation_id,
                *id,
                DeliveryStatus::Read,
                Some((reader.clone(), read_at)),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::protocol::ReadReceipts;
    use courier_shared::types::now_millis;

    fn conversation() -> RemoteConversation {
        RemoteConversation {
            id: ConversationId::new(),
            participants: vec![UserId::from("alice"), UserId::from("bob")],
            display_name: None,
            avatar_ref: None,
            admin_ids: Vec::new(),
            created_by: UserId::from("alice"),
            created_at: now_millis(),
        }
    }

    fn outbound(conversation_id: ConversationId, body: &str) -> RemoteMessage {
        RemoteMessage {
            id: MessageId::new(),
            conversation_id,
            sender_id: UserId::from("alice"),
            body: body.into(),
            local_created_at: now_millis(),
            server_timestamp: None,
            sequence: None,
            updated_at: None,
            delivery_status: DeliveryStatus::Sending,
            read_receipts: ReadReceipts::new(),
            is_system: false,
        }
    }

    #[tokio::test]
    async fn resending_the_same_id_is_an_upsert() {
        let remote = MemoryRemote::new();
        let c = conversation();
        remote.seed_conversation(c.clone());

        let m = outbound(c.id, "hello");
        let first = remote.send(&m).await.unwrap();
        let second = remote.send(&m).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(remote.messages(c.id).len(), 1);
        assert_eq!(remote.send_calls(), 2);
    }

    #[tokio::test]
    async fn sequences_and_timestamps_increase_per_conversation() {
        let remote = MemoryRemote::new();
        let c = conversation();
        remote.seed_conversation(c.clone());

        let a = remote.send(&outbound(c.id, "a")).await.unwrap();
        let b = remote.send(&outbound(c.id, "b")).await.unwrap();

        assert_eq!(a.sequence, Some(1));
        assert_eq!(b.sequence, Some(2));
        assert!(b.server_timestamp > a.server_timestamp);
    }

    #[tokio::test]
    async fn gatekeeper_rejects_unknown_conversation_and_empty_body() {
        let remote = MemoryRemote::new();
        let err = remote.send(&outbound(ConversationId::new(), "x")).await.unwrap_err();
        assert!(!err.is_retryable());

        let c = conversation();
        remote.seed_conversation(c.clone());
        let err = remote.send(&outbound(c.id, " ")).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Rejected {
                kind: RejectionKind::Malformed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let remote = MemoryRemote::new();
        let c = conversation();
        remote.seed_conversation(c.clone());
        remote.fail_next([DeliveryError::Server("503".into())]);

        let m = outbound(c.id, "hello");
        assert_eq!(
            remote.send(&m).await.unwrap_err(),
            DeliveryError::Server("503".into())
        );
        assert!(remote.send(&m).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_receive_writes_and_are_pruned_when_dropped() {
        let remote = MemoryRemote::new();
        let c = conversation();
        remote.seed_conversation(c.clone());

        let mut rx = remote.subscribe(c.id).await.unwrap();
        let m = outbound(c.id, "hello");
        remote.send(&m).await.unwrap();

        match rx.recv().await.unwrap() {
            RemoteEvent::MessageUpserted(stored) => {
                assert_eq!(stored.id, m.id);
                assert_eq!(stored.sequence, Some(1));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(remote.subscriber_count(c.id), 1);
        drop(rx);
        assert_eq!(remote.subscriber_count(c.id), 0);
    }

    #[tokio::test]
    async fn unreachable_remote_fails_every_call() {
        let remote = MemoryRemote::new();
        let c = conversation();
        remote.set_reachable(false);

        assert!(remote.create_conversation(&c).await.unwrap_err().is_retryable());
        assert!(remote.send(&outbound(c.id, "x")).await.unwrap_err().is_retryable());
        assert!(remote.subscribe(c.id).await.is_err());
    }
}
