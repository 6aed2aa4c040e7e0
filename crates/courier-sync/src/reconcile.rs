//! Merges acknowledgements and remote change events into the local store.
//!
//! All merging is synchronous and happens under one store lock per call, so
//! a merge and the conversation preview refresh it causes are never
//! interleaved with another writer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use courier_shared::protocol::{ReadReceipts, RemoteEvent, RemoteMessage, ServerAck};
use courier_shared::{ConversationId, DeliveryStatus, MessageId, SyncStatus};
use courier_store::{Database, Message, StoreError};

use crate::credentials::CredentialProvider;
use crate::error::{Result, SyncError};
use crate::{lock_store, SharedStore};

/// Conditions worth surfacing to the UI or diagnostics.  None of them is an
/// error of the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncSignal {
    /// A message arrived with a sequence number other than the next one.
    SequenceGap {
        conversation_id: ConversationId,
        expected: i64,
        received: i64,
    },
    /// A message left the automatic delivery path.
    MessageFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
        rejected: bool,
    },
    /// A conversation's history was re-fetched and merged.
    ConversationResynced {
        conversation_id: ConversationId,
        messages: usize,
    },
}

/// What applying one remote event did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// Older or equal to what is stored.
    Ignored,
    Deleted,
    Annotated,
    /// Refers to a message or conversation this device does not hold.
    Missing,
}

pub struct ReconciliationEngine {
    store: SharedStore,
    credentials: Arc<dyn CredentialProvider>,
    signals: broadcast::Sender<SyncSignal>,
}

impl ReconciliationEngine {
    pub fn new(
        store: SharedStore,
        credentials: Arc<dyn CredentialProvider>,
        signals: broadcast::Sender<SyncSignal>,
    ) -> Self {
        Self {
            store,
            credentials,
            signals,
        }
    }

    /// Record a successful delivery.  Idempotent: a second ack for the same
    /// message changes nothing, and server-assigned fields are only filled
    /// in while still empty.
    pub fn apply_ack(&self, id: MessageId, ack: &ServerAck) -> Result<Message> {
        let mut db = lock_store(&self.store)?;

        let before = db.find_message(id)?.ok_or(SyncError::UnknownMessage(id))?;
        let updated = db.update_message(id, |m| {
            if m.server_timestamp.is_none() {
                m.server_timestamp = Some(ack.server_timestamp);
            }
            if m.sequence.is_none() {
                m.sequence = ack.sequence;
            }
            m.remote_version = m.remote_version.max(Some(ack.server_timestamp));
            m.sync_status = SyncStatus::Synced;
            m.delivery_status = m.delivery_status.max(DeliveryStatus::Sent);
            m.rejected = false;
            m.last_sync_error = None;
        })?;

        if before.sequence.is_none() {
            if let Some(sequence) = updated.sequence {
                self.track_sequence(&mut db, updated.conversation_id, sequence)?;
            }
        }
        refresh_summary(&mut db, updated.conversation_id, 0)?;

        debug!(msg_id = %id, sequence = ?updated.sequence, "ack applied");
        Ok(updated)
    }

    /// Merge one event from a conversation subscription.
    pub fn apply_event(&self, event: RemoteEvent) -> Result<MergeOutcome> {
        let mut db = lock_store(&self.store)?;

        let outcome = match event {
            RemoteEvent::MessageUpserted(remote) => self.merge_message(&mut db, &remote, true)?,

            RemoteEvent::StatusChanged {
                message_id,
                delivery_status,
                read_receipts,
                updated_at,
                ..
            } => {
                let Some(local) = db.find_message(message_id)? else {
                    return Ok(MergeOutcome::Missing);
                };
                if !is_newer(Some(updated_at), local.remote_version) {
                    debug!(msg_id = %message_id, "stale status event ignored");
                    return Ok(MergeOutcome::Ignored);
                }
                db.update_message(message_id, |m| {
                    m.delivery_status = m.delivery_status.max(delivery_status);
                    merge_receipts(&mut m.read_receipts, &read_receipts);
                    m.remote_version = Some(updated_at);
                })?;
                MergeOutcome::Updated
            }

            RemoteEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                if !db.delete_message(message_id)? {
                    return Ok(MergeOutcome::Missing);
                }
                refresh_summary(&mut db, conversation_id, 0)?;
                MergeOutcome::Deleted
            }

            RemoteEvent::Enriched {
                message_id,
                metadata,
                ..
            } => {
                if db.find_message(message_id)?.is_none() {
                    return Ok(MergeOutcome::Missing);
                }
                db.update_message(message_id, |m| m.enrichment = Some(metadata))?;
                MergeOutcome::Annotated
            }
        };

        Ok(outcome)
    }

    /// Merge a full remote snapshot of one conversation and clear its gap
    /// flag.  Returns the number of messages inserted or updated.
    pub fn apply_history(
        &self,
        conversation_id: ConversationId,
        mut history: Vec<RemoteMessage>,
    ) -> Result<usize> {
        history.sort_by_key(|m| m.sequence);

        let mut db = lock_store(&self.store)?;
        if db.find_conversation(conversation_id)?.is_none() {
            return Err(SyncError::UnknownConversation(conversation_id));
        }

        let mut changed = 0;
        for remote in history.iter().filter(|m| m.conversation_id == conversation_id) {
            match self.merge_message(&mut db, remote, false)? {
                MergeOutcome::Inserted | MergeOutcome::Updated => changed += 1,
                _ => {}
            }
        }

        let highest = history.iter().filter_map(|m| m.sequence).max();
        db.update_conversation(conversation_id, |c| {
            c.highest_sequence = c.highest_sequence.max(highest);
            c.sequence_gap = false;
        })?;

        let _ = self.signals.send(SyncSignal::ConversationResynced {
            conversation_id,
            messages: changed,
        });
        Ok(changed)
    }

    /// Recompute a conversation's preview fields from its newest message.
    pub fn refresh_summary(&self, conversation_id: ConversationId) -> Result<()> {
        let mut db = lock_store(&self.store)?;
        refresh_summary(&mut db, conversation_id, 0)
    }

    fn merge_message(
        &self,
        db: &mut Database,
        remote: &RemoteMessage,
        track_gaps: bool,
    ) -> Result<MergeOutcome> {
        let conversation_id = remote.conversation_id;

        let Some(local) = db.find_message(remote.id)? else {
            if db.find_conversation(conversation_id)?.is_none() {
                debug!(conversation = %conversation_id, "message for unknown conversation");
                return Ok(MergeOutcome::Missing);
            }

            let message = Message::from_remote(remote);
            db.insert_message(&message)?;
            if track_gaps {
                if let Some(sequence) = message.sequence {
                    self.track_sequence(db, conversation_id, sequence)?;
                }
            }

            let from_other = !message.is_system
                && self
                    .credentials
                    .current_user_id()
                    .map_or(true, |me| me != message.sender_id);
            refresh_summary(db, conversation_id, u32::from(from_other))?;

            debug!(msg_id = %message.id, conversation = %conversation_id, "remote message inserted");
            return Ok(MergeOutcome::Inserted);
        };

        let incoming = remote.updated_at.or(remote.server_timestamp);
        if !is_newer(incoming, local.remote_version) {
            debug!(msg_id = %remote.id, "stale or duplicate remote write ignored");
            return Ok(MergeOutcome::Ignored);
        }

        let updated = db.update_message(remote.id, |m| {
            m.body = remote.body.clone();
            m.server_timestamp = remote.server_timestamp.or(m.server_timestamp);
            m.sequence = m.sequence.or(remote.sequence);
            m.remote_version = incoming;
            m.delivery_status = m
                .delivery_status
                .max(remote.delivery_status)
                .max(DeliveryStatus::Sent);
            merge_receipts(&mut m.read_receipts, &remote.read_receipts);
            m.sync_status = SyncStatus::Synced;
            m.rejected = false;
            m.last_sync_error = None;
        })?;

        if track_gaps && local.sequence.is_none() {
            if let Some(sequence) = updated.sequence {
                self.track_sequence(db, conversation_id, sequence)?;
            }
        }
        refresh_summary(db, conversation_id, 0)?;

        Ok(MergeOutcome::Updated)
    }

    /// Called when a message first acquires `sequence`.
    fn track_sequence(
        &self,
        db: &mut Database,
        conversation_id: ConversationId,
        sequence: i64,
    ) -> Result<()> {
        let Some(conversation) = db.find_conversation(conversation_id)? else {
            return Ok(());
        };

        let gap = match conversation.highest_sequence {
            Some(highest) if sequence != highest + 1 => Some(highest + 1),
            _ => None,
        };

        db.update_conversation(conversation_id, |c| {
            c.highest_sequence = Some(sequence);
            if gap.is_some() {
                c.sequence_gap = true;
            }
        })?;

        if let Some(expected) = gap {
            warn!(
                conversation = %conversation_id,
                expected,
                received = sequence,
                "sequence gap detected"
            );
            let _ = self.signals.send(SyncSignal::SequenceGap {
                conversation_id,
                expected,
                received: sequence,
            });
        }
        Ok(())
    }
}

/// Last-write-wins: only a strictly newer version replaces the stored one.
fn is_newer(
    incoming: Option<chrono::DateTime<chrono::Utc>>,
    stored: Option<chrono::DateTime<chrono::Utc>>,
) -> bool {
    match (incoming, stored) {
        (Some(incoming), Some(stored)) => incoming > stored,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn merge_receipts(into: &mut ReadReceipts, from: &ReadReceipts) {
    for (reader, at) in from {
        into.entry(reader.clone()).or_insert(*at);
    }
}

/// Recompute the preview fields from the store's newest message, adding
/// `new_unread` to the unread counter.  A deleted conversation is skipped.
pub(crate) fn refresh_summary(
    db: &mut Database,
    conversation_id: ConversationId,
    new_unread: u32,
) -> Result<()> {
    let latest = db.latest_message(conversation_id)?;
    match db.update_conversation(conversation_id, |c| {
        c.set_last_message(latest.as_ref());
        c.unread_count = c.unread_count.saturating_add(new_unread);
    }) {
        Ok(_) | Err(StoreError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use courier_shared::types::from_millis;
    use courier_shared::UserId;
    use courier_store::Conversation;

    use crate::credentials::StaticCredentials;

    fn at(ms: i64) -> DateTime<Utc> {
        from_millis(ms).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: SharedStore,
        engine: ReconciliationEngine,
        signals: broadcast::Receiver<SyncSignal>,
        conversation: Conversation,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let conversation =
            Conversation::new(UserId::from("alice"), vec![UserId::from("bob")], at(0)).unwrap();
        db.create_conversation(&conversation).unwrap();

        let store = crate::share(db);
        let (tx, rx) = broadcast::channel(16);
        let engine = ReconciliationEngine::new(
            store.clone(),
            Arc::new(StaticCredentials::signed_in("alice")),
            tx,
        );
        Fixture {
            _dir: dir,
            store,
            engine,
            signals: rx,
            conversation,
        }
    }

    fn remote(c: ConversationId, sender: &str, local: i64, server: i64, seq: i64) -> RemoteMessage {
        RemoteMessage {
            id: MessageId::new(),
            conversation_id: c,
            sender_id: UserId::from(sender),
            body: format!("at {server}"),
            local_created_at: at(local),
            server_timestamp: Some(at(server)),
            sequence: Some(seq),
            updated_at: Some(at(server)),
            delivery_status: DeliveryStatus::Sent,
            read_receipts: ReadReceipts::new(),
            is_system: false,
        }
    }

    fn stored(f: &Fixture, id: MessageId) -> Message {
        f.store.lock().unwrap().get_message(id).unwrap()
    }

    fn conversation(f: &Fixture) -> Conversation {
        f.store.lock().unwrap().get_conversation(f.conversation.id).unwrap()
    }

    #[test]
    fn ack_marks_synced_and_is_idempotent() {
        let f = fixture();
        let m = Message::outgoing(f.conversation.id, UserId::from("alice"), "hi", at(10), 3).unwrap();
        f.store.lock().unwrap().insert_message(&m).unwrap();

        let ack = ServerAck {
            message_id: m.id,
            server_timestamp: at(50),
            sequence: Some(1),
        };
        let first = f.engine.apply_ack(m.id, &ack).unwrap();
        assert_eq!(first.sync_status, SyncStatus::Synced);
        assert_eq!(first.delivery_status, DeliveryStatus::Sent);
        assert_eq!(first.server_timestamp, Some(at(50)));
        assert_eq!(first.sequence, Some(1));

        let later = ServerAck {
            message_id: m.id,
            server_timestamp: at(90),
            sequence: Some(4),
        };
        let second = f.engine.apply_ack(m.id, &later).unwrap();
        assert_eq!(second.server_timestamp, Some(at(50)));
        assert_eq!(second.sequence, Some(1));
        assert_eq!(conversation(&f).highest_sequence, Some(1));
    }

    #[test]
    fn ack_for_unknown_message_is_an_error() {
        let f = fixture();
        let ack = ServerAck {
            message_id: MessageId::new(),
            server_timestamp: at(1),
            sequence: None,
        };
        assert!(matches!(
            f.engine.apply_ack(ack.message_id, &ack),
            Err(SyncError::UnknownMessage(_))
        ));
    }

    #[test]
    fn older_or_equal_remote_versions_do_not_regress() {
        let f = fixture();
        let original = remote(f.conversation.id, "bob", 10, 200, 1);
        assert_eq!(
            f.engine
                .apply_event(RemoteEvent::MessageUpserted(original.clone()))
                .unwrap(),
            MergeOutcome::Inserted
        );

        let mut equal = original.clone();
        equal.body = "rewritten".into();
        equal.delivery_status = DeliveryStatus::Read;
        assert_eq!(
            f.engine.apply_event(RemoteEvent::MessageUpserted(equal)).unwrap(),
            MergeOutcome::Ignored
        );

        let mut older = original.clone();
        older.body = "older".into();
        older.server_timestamp = Some(at(150));
        older.updated_at = Some(at(150));
        assert_eq!(
            f.engine.apply_event(RemoteEvent::MessageUpserted(older)).unwrap(),
            MergeOutcome::Ignored
        );

        let stale_status = RemoteEvent::StatusChanged {
            conversation_id: f.conversation.id,
            message_id: original.id,
            delivery_status: DeliveryStatus::Read,
            read_receipts: ReadReceipts::new(),
            updated_at: at(200),
        };
        assert_eq!(f.engine.apply_event(stale_status).unwrap(), MergeOutcome::Ignored);

        let m = stored(&f, original.id);
        assert_eq!(m.body, original.body);
        assert_eq!(m.server_timestamp, Some(at(200)));
        assert_eq!(m.delivery_status, DeliveryStatus::Sent);
    }

    #[test]
    fn newer_status_event_applies_and_merges_receipts() {
        let f = fixture();
        let original = remote(f.conversation.id, "alice", 10, 200, 1);
        f.engine
            .apply_event(RemoteEvent::MessageUpserted(original.clone()))
            .unwrap();

        let mut receipts = ReadReceipts::new();
        receipts.insert(UserId::from("bob"), at(260));
        let event = RemoteEvent::StatusChanged {
            conversation_id: f.conversation.id,
            message_id: original.id,
            delivery_status: DeliveryStatus::Read,
            read_receipts: receipts,
            updated_at: at(260),
        };
        assert_eq!(f.engine.apply_event(event).unwrap(), MergeOutcome::Updated);

        let m = stored(&f, original.id);
        assert_eq!(m.delivery_status, DeliveryStatus::Read);
        assert_eq!(m.read_receipts.get(&UserId::from("bob")), Some(&at(260)));
        assert_eq!(m.remote_version, Some(at(260)));
    }

    #[test]
    fn last_message_follows_server_time_not_arrival_order() {
        let f = fixture();
        for (seq, server) in [(1, 100), (2, 300), (3, 200)] {
            f.engine
                .apply_event(RemoteEvent::MessageUpserted(remote(
                    f.conversation.id,
                    "bob",
                    seq,
                    server,
                    seq,
                )))
                .unwrap();
        }

        let c = conversation(&f);
        assert_eq!(c.last_message_text.as_deref(), Some("at 300"));
        assert_eq!(c.last_message_at, Some(at(300)));
        assert_eq!(c.unread_count, 3);
    }

    #[test]
    fn sequence_gap_is_flagged_but_message_is_kept() {
        let mut f = fixture();
        for seq in 1..=3 {
            f.engine
                .apply_event(RemoteEvent::MessageUpserted(remote(
                    f.conversation.id,
                    "bob",
                    seq,
                    seq * 10,
                    seq,
                )))
                .unwrap();
        }
        assert!(!conversation(&f).sequence_gap);
        assert!(f.signals.try_recv().is_err());

        let jumped = remote(f.conversation.id, "bob", 5, 50, 5);
        assert_eq!(
            f.engine
                .apply_event(RemoteEvent::MessageUpserted(jumped.clone()))
                .unwrap(),
            MergeOutcome::Inserted
        );

        assert_eq!(stored(&f, jumped.id).sequence, Some(5));
        let c = conversation(&f);
        assert!(c.sequence_gap);
        assert_eq!(c.highest_sequence, Some(5));
        assert_eq!(
            f.signals.try_recv().unwrap(),
            SyncSignal::SequenceGap {
                conversation_id: f.conversation.id,
                expected: 4,
                received: 5
            }
        );
    }

    #[test]
    fn history_fills_the_gap_and_clears_the_flag() {
        let mut f = fixture();
        let messages: Vec<RemoteMessage> = (1..=5)
            .map(|seq| remote(f.conversation.id, "bob", seq, seq * 10, seq))
            .collect();
        for m in [&messages[0], &messages[1], &messages[2], &messages[4]] {
            f.engine
                .apply_event(RemoteEvent::MessageUpserted((*m).clone()))
                .unwrap();
        }
        assert!(conversation(&f).sequence_gap);
        let _ = f.signals.try_recv();

        assert_eq!(f.engine.apply_history(f.conversation.id, messages).unwrap(), 1);

        let c = conversation(&f);
        assert!(!c.sequence_gap);
        assert_eq!(c.highest_sequence, Some(5));
        assert_eq!(
            f.store
                .lock()
                .unwrap()
                .messages_for_conversation(f.conversation.id)
                .unwrap()
                .len(),
            5
        );
        assert_eq!(
            f.signals.try_recv().unwrap(),
            SyncSignal::ConversationResynced {
                conversation_id: f.conversation.id,
                messages: 1
            }
        );
    }

    #[test]
    fn own_messages_do_not_count_as_unread() {
        let f = fixture();
        f.engine
            .apply_event(RemoteEvent::MessageUpserted(remote(
                f.conversation.id,
                "alice",
                1,
                10,
                1,
            )))
            .unwrap();
        assert_eq!(conversation(&f).unread_count, 0);
    }

    #[test]
    fn enrichment_and_deletion() {
        let f = fixture();
        let first = remote(f.conversation.id, "bob", 1, 10, 1);
        let second = remote(f.conversation.id, "bob", 2, 20, 2);
        for m in [&first, &second] {
            f.engine
                .apply_event(RemoteEvent::MessageUpserted(m.clone()))
                .unwrap();
        }

        let annotate = RemoteEvent::Enriched {
            conversation_id: f.conversation.id,
            message_id: first.id,
            metadata: serde_json::json!({ "sentiment": "positive" }),
        };
        assert_eq!(f.engine.apply_event(annotate).unwrap(), MergeOutcome::Annotated);
        let m = stored(&f, first.id);
        assert_eq!(m.enrichment, Some(serde_json::json!({ "sentiment": "positive" })));
        assert_eq!(m.remote_version, Some(at(10)));

        let delete = RemoteEvent::MessageDeleted {
            conversation_id: f.conversation.id,
            message_id: second.id,
        };
        assert_eq!(f.engine.apply_event(delete.clone()).unwrap(), MergeOutcome::Deleted);
        assert_eq!(f.engine.apply_event(delete).unwrap(), MergeOutcome::Missing);
        assert_eq!(conversation(&f).last_message_id, Some(first.id));
    }

    #[test]
    fn events_for_unknown_conversations_are_skipped() {
        let f = fixture();
        let stray = remote(ConversationId::new(), "bob", 1, 10, 1);
        assert_eq!(
            f.engine.apply_event(RemoteEvent::MessageUpserted(stray)).unwrap(),
            MergeOutcome::Missing
        );
    }
}
