//! Orchestrates the sync core: watches connectivity, decides when to drain
//! the outbound queue, runs conversation listeners and exposes the user
//! operations that write to the local store.
//!
//! Every write goes to the local store first and returns as soon as it is
//! committed; delivery happens later, driven by the coordinator loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use courier_shared::types::now_millis;
use courier_shared::{ConversationId, MessageId, SyncStatus, UserId};
use courier_store::{validate_body, Conversation, Database, Message, StoreError, StoreEvent};

use crate::config::SyncConfig;
use crate::credentials::CredentialProvider;
use crate::error::{Result, SyncError};
use crate::queue::{DrainReport, OutboundQueue};
use crate::reconcile::{refresh_summary, ReconciliationEngine, SyncSignal};
use crate::remote::RemoteHandle;
use crate::{lock_store, SharedStore};

const SIGNAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Offline,
    Draining,
    Idle,
}

/// Snapshot published to observers after every phase change and local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub online: bool,
    pub phase: SyncPhase,
    /// Messages waiting for their first successful delivery.
    pub pending: u32,
    /// Messages that need user attention.
    pub failed: u32,
}

struct Inner {
    store: SharedStore,
    remote: RemoteHandle,
    credentials: Arc<dyn CredentialProvider>,
    config: SyncConfig,
    reconciler: Arc<ReconciliationEngine>,
    queue: OutboundQueue,
    connectivity: watch::Receiver<bool>,
    state: watch::Sender<SyncState>,
    signals: broadcast::Sender<SyncSignal>,
    kick: Notify,
    drain_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<HashMap<ConversationId, JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listeners = match self.listeners.get_mut() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, task) in listeners.drain() {
            task.abort();
        }
    }
}

/// Cheap to clone; all clones drive the same sync core.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        store: SharedStore,
        remote: RemoteHandle,
        credentials: Arc<dyn CredentialProvider>,
        connectivity: watch::Receiver<bool>,
        config: SyncConfig,
    ) -> Result<Self> {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let reconciler = Arc::new(ReconciliationEngine::new(
            store.clone(),
            credentials.clone(),
            signals.clone(),
        ));
        let queue = OutboundQueue::new(
            store.clone(),
            remote.clone(),
            reconciler.clone(),
            config.clone(),
            signals.clone(),
        );

        let counts = lock_store(&store)?.sync_counts()?;
        let online = *connectivity.borrow();
        let (state, _) = watch::channel(SyncState {
            online,
            phase: if online { SyncPhase::Idle } else { SyncPhase::Offline },
            pending: counts.pending,
            failed: counts.failed,
        });

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                credentials,
                config,
                reconciler,
                queue,
                connectivity,
                state,
                signals,
                kick: Notify::new(),
                drain_lock: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Spawn the coordinator loop.  It drains when connectivity comes back,
    /// after local writes and on every `drain_interval` tick, and stops when
    /// the connectivity source goes away.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self) {
        let mut online = self.inner.connectivity.clone();
        let mut tick = tokio::time::interval(self.inner.config.drain_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("sync coordinator started");
        loop {
            let trigger = tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    "connectivity"
                }
                _ = self.inner.kick.notified() => "local write",
                _ = tick.tick() => "interval",
            };

            let is_online = *online.borrow_and_update();
            if !is_online {
                if let Err(e) = self.publish(SyncPhase::Offline) {
                    warn!(error = %e, "failed to publish sync state");
                }
                continue;
            }

            debug!(trigger, "drain triggered");
            if let Err(e) = self.drain_now().await {
                warn!(error = %e, "drain failed");
            }
        }
        info!("connectivity source closed, sync coordinator stopped");
    }

    /// Drain the outbound queue now.  Concurrent calls run one after the
    /// other.
    pub async fn drain_now(&self) -> Result<DrainReport> {
        let _running = self.inner.drain_lock.lock().await;

        let online = self.inner.connectivity.clone();
        if !*online.borrow() {
            self.publish(SyncPhase::Offline)?;
            return Ok(DrainReport {
                interrupted: true,
                ..DrainReport::default()
            });
        }

        self.publish(SyncPhase::Draining)?;
        let result = self.inner.queue.drain(online.clone()).await;

        let phase = if *online.borrow() {
            SyncPhase::Idle
        } else {
            SyncPhase::Offline
        };
        self.publish(phase)?;
        result
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn signals(&self) -> broadcast::Receiver<SyncSignal> {
        self.inner.signals.subscribe()
    }

    pub fn store_events(&self) -> Result<broadcast::Receiver<StoreEvent>> {
        Ok(lock_store(&self.inner.store)?.subscribe())
    }

    pub fn conversations(&self, include_archived: bool) -> Result<Vec<Conversation>> {
        Ok(lock_store(&self.inner.store)?.list_conversations(include_archived)?)
    }

    pub fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        lock_store(&self.inner.store)?
            .find_conversation(id)?
            .ok_or(SyncError::UnknownConversation(id))
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        Ok(lock_store(&self.inner.store)?.messages_for_conversation(conversation_id)?)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a message locally as `pending` and schedule its delivery.
    /// Returns once the local commit is visible to observers.
    pub fn send_message(
        &self,
        conversation_id: ConversationId,
        body: impl Into<String>,
    ) -> Result<Message> {
        let me = self.current_user()?;

        let message = {
            let mut db = lock_store(&self.inner.store)?;
            let conversation = db
                .find_conversation(conversation_id)?
                .ok_or(SyncError::UnknownConversation(conversation_id))?;
            if !conversation.has_participant(&me) {
                return Err(courier_shared::ValidationError::NotParticipant.into());
            }

            let message = Message::outgoing(
                conversation_id,
                me,
                body,
                now_millis(),
                self.inner.config.retry.max_attempts,
            )?;
            db.insert_message(&message)?;
            refresh_summary(&mut db, conversation_id, 0)?;
            message
        };

        debug!(msg_id = %message.id, conversation = %conversation_id, "message queued");
        self.publish_counts();
        self.inner.kick.notify_one();
        Ok(message)
    }

    /// Write a local-only notice such as "Bob joined".  Never delivered.
    pub fn post_system_message(
        &self,
        conversation_id: ConversationId,
        body: impl Into<String>,
    ) -> Result<Message> {
        let body = body.into();
        validate_body(&body)?;

        let mut db = lock_store(&self.inner.store)?;
        if db.find_conversation(conversation_id)?.is_none() {
            return Err(SyncError::UnknownConversation(conversation_id));
        }
        let message = Message::system(conversation_id, body, now_millis());
        db.insert_message(&message)?;
        refresh_summary(&mut db, conversation_id, 0)?;
        Ok(message)
    }

    /// Create a conversation between the signed-in user and `participants`.
    /// The record is pushed to the remote store before any of its messages.
    pub fn create_conversation(
        &self,
        participants: Vec<UserId>,
        display_name: Option<String>,
    ) -> Result<Conversation> {
        let me = self.current_user()?;
        let mut conversation = Conversation::new(me, participants, now_millis())?;
        if conversation.is_group() {
            conversation.display_name = display_name;
        }

        lock_store(&self.inner.store)?.create_conversation(&conversation)?;
        info!(conversation = %conversation.id, participants = conversation.participants.len(), "conversation created");

        self.inner.kick.notify_one();
        Ok(conversation)
    }

    /// Put a failed message back on the automatic delivery path with a fresh
    /// attempt budget.  The retry count keeps counting.
    pub fn retry_message(&self, id: MessageId) -> Result<Message> {
        let message = {
            let mut db = lock_store(&self.inner.store)?;
            let message = db.find_message(id)?.ok_or(SyncError::UnknownMessage(id))?;
            if message.sync_status != SyncStatus::Failed {
                return Err(SyncError::InvalidState(format!(
                    "message {id} is {}, only failed messages can be retried",
                    message.sync_status.as_str()
                )));
            }
            self.reopen(&mut db, &message)?
        };

        info!(msg_id = %id, ceiling = message.attempt_ceiling, "manual retry");
        self.publish_counts();
        self.inner.kick.notify_one();
        Ok(message)
    }

    /// Retry every failed message of a conversation that still has lifetime
    /// budget left.  Returns how many were requeued.
    pub fn retry_conversation(&self, conversation_id: ConversationId) -> Result<usize> {
        let requeued = {
            let mut db = lock_store(&self.inner.store)?;
            let conversation = db
                .find_conversation(conversation_id)?
                .ok_or(SyncError::UnknownConversation(conversation_id))?;
            if conversation.sync_status == SyncStatus::Failed {
                reopen_conversation(&mut db, conversation_id)?;
            }

            let failed: Vec<Message> = db
                .messages_for_conversation(conversation_id)?
                .into_iter()
                .filter(|m| m.sync_status == SyncStatus::Failed)
                .collect();

            let mut requeued = 0;
            for message in &failed {
                match self.reopen(&mut db, message) {
                    Ok(_) => requeued += 1,
                    Err(SyncError::RetryLimitReached { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            requeued
        };

        self.publish_counts();
        self.inner.kick.notify_one();
        Ok(requeued)
    }

    /// Drop a failed message for good.
    pub fn discard_message(&self, id: MessageId) -> Result<()> {
        {
            let mut db = lock_store(&self.inner.store)?;
            let message = db.find_message(id)?.ok_or(SyncError::UnknownMessage(id))?;
            if message.sync_status != SyncStatus::Failed {
                return Err(SyncError::InvalidState(format!(
                    "message {id} is {}, only failed messages can be discarded",
                    message.sync_status.as_str()
                )));
            }
            db.delete_message(id)?;
            refresh_summary(&mut db, message.conversation_id, 0)?;
        }

        info!(msg_id = %id, "failed message discarded");
        self.publish_counts();
        Ok(())
    }

    /// Mark everything from other participants as read, locally and, when
    /// online, remotely.  Returns how many messages were newly marked.
    pub async fn mark_conversation_read(&self, conversation_id: ConversationId) -> Result<usize> {
        let me = self.current_user()?;
        let read_at = now_millis();

        let marked = {
            let mut db = lock_store(&self.inner.store)?;
            if db.find_conversation(conversation_id)?.is_none() {
                return Err(SyncError::UnknownConversation(conversation_id));
            }
            let marked = db.mark_read_by(conversation_id, &me, read_at)?;
            db.update_conversation(conversation_id, |c| c.unread_count = 0)?;
            marked
        };

        if !marked.is_empty() && *self.inner.connectivity.borrow() {
            let receipt = self
                .inner
                .remote
                .send_read_receipt(conversation_id, &marked, &me, read_at);
            match tokio::time::timeout(self.inner.config.send_timeout, receipt).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(conversation = %conversation_id, error = %e, "read receipt not sent"),
                Err(_) => debug!(conversation = %conversation_id, "read receipt timed out"),
            }
        }
        Ok(marked.len())
    }

    pub fn set_pinned(&self, id: ConversationId, pinned: bool) -> Result<Conversation> {
        self.update_conversation(id, |c| c.pinned = pinned)
    }

    pub fn set_muted(&self, id: ConversationId, muted: bool) -> Result<Conversation> {
        self.update_conversation(id, |c| c.muted = muted)
    }

    /// Archiving hides a conversation from the default listing.
    pub fn set_archived(&self, id: ConversationId, archived: bool) -> Result<Conversation> {
        self.update_conversation(id, |c| c.archived = archived)
    }

    /// Remove a conversation and its messages from this device.
    pub async fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        self.close_conversation(id).await?;
        let deleted = lock_store(&self.inner.store)?.delete_conversation(id)?;
        if deleted {
            info!(conversation = %id, "conversation deleted");
            self.publish_counts();
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Start listening for remote changes to a conversation.  Reopening an
    /// open conversation replaces its listener.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        if lock_store(&self.inner.store)?
            .find_conversation(conversation_id)?
            .is_none()
        {
            return Err(SyncError::UnknownConversation(conversation_id));
        }

        let mut events = self.inner.remote.subscribe(conversation_id).await?;
        let reconciler = self.inner.reconciler.clone();

        let task = tokio::spawn(async move {
            debug!(conversation = %conversation_id, "listener started");
            while let Some(event) = events.recv().await {
                let message_id = event.message_id();
                match reconciler.apply_event(event) {
                    Ok(outcome) => {
                        debug!(conversation = %conversation_id, msg_id = %message_id, ?outcome, "remote event applied")
                    }
                    Err(e) => {
                        warn!(conversation = %conversation_id, msg_id = %message_id, error = %e, "failed to apply remote event")
                    }
                }
            }
            debug!(conversation = %conversation_id, "listener stopped");
        });

        if let Some(previous) = self.listeners()?.insert(conversation_id, task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop listening.  Cancels the remote subscription; messages already
    /// in flight keep going.  Returns whether a listener was running.
    pub async fn close_conversation(&self, conversation_id: ConversationId) -> Result<bool> {
        let task = self.listeners()?.remove(&conversation_id);
        match task {
            Some(task) => {
                task.abort();
                let _ = task.await;
                debug!(conversation = %conversation_id, "conversation closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_open(&self, conversation_id: ConversationId) -> bool {
        self.listeners()
            .map(|listeners| listeners.contains_key(&conversation_id))
            .unwrap_or(false)
    }

    /// Re-fetch a conversation's history and merge it, clearing a flagged
    /// sequence gap.  Returns how many messages changed locally.
    pub async fn resync_conversation(&self, conversation_id: ConversationId) -> Result<usize> {
        let fetch = self.inner.remote.fetch_history(conversation_id);
        let history = tokio::time::timeout(self.inner.config.send_timeout, fetch)
            .await
            .map_err(|_| courier_shared::DeliveryError::Timeout(self.inner.config.send_timeout))??;

        let changed = self.inner.reconciler.apply_history(conversation_id, history)?;
        info!(conversation = %conversation_id, changed, "conversation resynced");
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn current_user(&self) -> Result<UserId> {
        self.inner
            .credentials
            .current_user_id()
            .ok_or(SyncError::NotSignedIn)
    }

    fn listeners(&self) -> Result<MutexGuard<'_, HashMap<ConversationId, JoinHandle<()>>>> {
        self.inner.listeners.lock().map_err(|_| SyncError::LockPoisoned)
    }

    fn update_conversation<F>(&self, id: ConversationId, mutate: F) -> Result<Conversation>
    where
        F: FnOnce(&mut Conversation),
    {
        let mut db = lock_store(&self.inner.store)?;
        match db.update_conversation(id, mutate) {
            Ok(c) => Ok(c),
            Err(StoreError::NotFound) => Err(SyncError::UnknownConversation(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a failed message back to `pending` with a raised attempt
    /// ceiling, unblocking its conversation record if that failed too.
    fn reopen(&self, db: &mut Database, message: &Message) -> Result<Message> {
        let ceiling = self
            .inner
            .config
            .retry
            .manual_retry_ceiling(message.retry_count)
            .ok_or(SyncError::RetryLimitReached {
                id: message.id,
                attempts: message.retry_count,
            })?;

        if let Some(conversation) = db.find_conversation(message.conversation_id)? {
            if conversation.sync_status == SyncStatus::Failed {
                reopen_conversation(db, conversation.id)?;
            }
        }

        Ok(db.update_message(message.id, |m| {
            m.sync_status = SyncStatus::Pending;
            m.rejected = false;
            m.attempt_ceiling = m.attempt_ceiling.max(ceiling);
            m.last_sync_error = None;
        })?)
    }

    fn publish(&self, phase: SyncPhase) -> Result<()> {
        let counts = lock_store(&self.inner.store)?.sync_counts()?;
        let online = *self.inner.connectivity.borrow();
        let next = SyncState {
            online,
            phase,
            pending: counts.pending,
            failed: counts.failed,
        };

        let previous = self.inner.state.send_replace(next);
        if previous.phase != phase {
            info!(?phase, pending = next.pending, failed = next.failed, "sync phase changed");
        }
        Ok(())
    }

    fn publish_counts(&self) {
        let phase = self.inner.state.borrow().phase;
        if let Err(e) = self.publish(phase) {
            warn!(error = %e, "failed to publish sync state");
        }
    }
}

fn reopen_conversation(db: &mut Database, id: ConversationId) -> Result<()> {
    db.update_conversation(id, |c| {
        c.sync_status = SyncStatus::Pending;
        c.retry_count = 0;
        c.last_sync_error = None;
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use courier_shared::protocol::{ReadReceipts, RemoteMessage};
    use courier_shared::{DeliveryError, DeliveryStatus};

    use crate::connectivity::Connectivity;
    use crate::credentials::StaticCredentials;
    use crate::memory::MemoryRemote;
    use crate::policy::RetryPolicy;

    fn fast_config() -> SyncConfig {
        SyncConfig {
            retry: RetryPolicy {
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(5),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            send_timeout: Duration::from_millis(200),
            drain_interval: Duration::from_secs(60),
        }
    }

    struct Device {
        _dir: tempfile::TempDir,
        connectivity: Connectivity,
        credentials: Arc<StaticCredentials>,
        sync: SyncCoordinator,
    }

    fn device(user: &str, remote: &Arc<MemoryRemote>, online: bool) -> Device {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let connectivity = Connectivity::new(online);
        let credentials = Arc::new(StaticCredentials::signed_in(user));
        let sync = SyncCoordinator::new(
            crate::share(db),
            remote.clone(),
            credentials.clone(),
            connectivity.subscribe(),
            fast_config(),
        )
        .unwrap();
        Device {
            _dir: dir,
            connectivity,
            credentials,
            sync,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn peer_message(c: ConversationId, body: &str) -> RemoteMessage {
        RemoteMessage {
            id: MessageId::new(),
            conversation_id: c,
            sender_id: UserId::from("bob"),
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
    async fn offline_send_is_visible_then_synced_on_reconnect() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, false);
        let loop_task = alice.sync.start();

        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        let m = alice.sync.send_message(c.id, "hello").unwrap();

        let visible = alice.sync.messages(c.id).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, m.id);
        assert_eq!(visible[0].sync_status, SyncStatus::Pending);
        assert_eq!(alice.sync.current_state().pending, 1);
        assert_eq!(
            alice.sync.conversation(c.id).unwrap().last_message_text.as_deref(),
            Some("hello")
        );

        alice.connectivity.set_online(true);
        eventually(|| {
            alice.sync.messages(c.id).unwrap()[0].sync_status == SyncStatus::Synced
        })
        .await;

        let synced = &alice.sync.messages(c.id).unwrap()[0];
        assert!(synced.server_timestamp.is_some());
        assert_eq!(synced.sequence, Some(1));

        eventually(|| {
            let state = alice.sync.current_state();
            state.phase == SyncPhase::Idle && state.pending == 0
        })
        .await;
        assert!(remote.conversation(c.id).is_some());

        loop_task.abort();
    }

    #[tokio::test]
    async fn concurrent_offline_sends_from_two_devices_both_survive() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let bob = device("bob", &remote, false);

        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        alice.sync.drain_now().await.unwrap();
        bob.sync
            .inner
            .store
            .lock()
            .unwrap()
            .create_conversation(&Conversation::from_remote(&remote.conversation(c.id).unwrap()))
            .unwrap();

        alice.connectivity.set_online(false);
        let from_alice = alice.sync.send_message(c.id, "from alice").unwrap();
        let from_bob = bob.sync.send_message(c.id, "from bob").unwrap();
        assert_ne!(from_alice.id, from_bob.id);

        alice.connectivity.set_online(true);
        bob.connectivity.set_online(true);
        let (a, b) = tokio::join!(alice.sync.drain_now(), bob.sync.drain_now());
        assert_eq!(a.unwrap().delivered, 1);
        assert_eq!(b.unwrap().delivered, 1);

        let stored = remote.messages(c.id);
        assert_eq!(stored.len(), 2);
        assert_ne!(stored[0].server_timestamp, stored[1].server_timestamp);

        assert_eq!(alice.sync.resync_conversation(c.id).await.unwrap(), 1);
        let bodies: Vec<String> = alice
            .sync
            .messages(c.id)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies.len(), 2);
        assert!(bodies.contains(&"from alice".to_string()));
        assert!(bodies.contains(&"from bob".to_string()));
    }

    #[tokio::test]
    async fn listener_applies_peer_messages_and_read_receipts_go_out() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        alice.sync.drain_now().await.unwrap();
        alice.sync.open_conversation(c.id).await.unwrap();

        let incoming = peer_message(c.id, "hi alice");
        remote.deliver_from_peer(incoming.clone()).unwrap();

        eventually(|| alice.sync.messages(c.id).unwrap().len() == 1).await;
        assert_eq!(alice.sync.conversation(c.id).unwrap().unread_count, 1);

        assert_eq!(alice.sync.mark_conversation_read(c.id).await.unwrap(), 1);
        assert_eq!(alice.sync.conversation(c.id).unwrap().unread_count, 0);

        let remote_copy = &remote.messages(c.id)[0];
        assert_eq!(remote_copy.delivery_status, DeliveryStatus::Read);
        assert!(remote_copy.read_receipts.contains_key(&UserId::from("alice")));

        eventually(|| {
            alice.sync.messages(c.id).unwrap()[0].delivery_status == DeliveryStatus::Read
        })
        .await;
    }

    #[tokio::test]
    async fn closing_a_conversation_cancels_its_subscription() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();

        alice.sync.open_conversation(c.id).await.unwrap();
        assert!(alice.sync.is_open(c.id));
        assert_eq!(remote.subscriber_count(c.id), 1);

        assert!(alice.sync.close_conversation(c.id).await.unwrap());
        assert!(!alice.sync.is_open(c.id));
        assert_eq!(remote.subscriber_count(c.id), 0);
        assert!(!alice.sync.close_conversation(c.id).await.unwrap());
    }

    #[tokio::test]
    async fn manual_retry_raises_the_ceiling_without_resetting_the_count() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        alice.sync.drain_now().await.unwrap();

        let m = alice.sync.send_message(c.id, "hello").unwrap();
        remote.fail_next((0..3).map(|_| DeliveryError::Server("503".into())));
        alice.sync.drain_now().await.unwrap();
        assert_eq!(alice.sync.current_state().failed, 1);

        let retried = alice.sync.retry_message(m.id).unwrap();
        assert_eq!(retried.sync_status, SyncStatus::Pending);
        assert_eq!(retried.retry_count, 3);
        assert_eq!(retried.attempt_ceiling, 6);

        let report = alice.sync.drain_now().await.unwrap();
        assert_eq!(report.delivered, 1);
        let delivered = &alice.sync.messages(c.id).unwrap()[0];
        assert_eq!(delivered.sync_status, SyncStatus::Synced);
        assert_eq!(delivered.retry_count, 3);

        assert!(matches!(
            alice.sync.retry_message(m.id),
            Err(SyncError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn message_behind_failed_conversation_surfaces_and_retries() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        let m = alice.sync.send_message(c.id, "hello").unwrap();

        remote.set_reachable(false);
        let report = alice.sync.drain_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 0);

        let state = alice.sync.current_state();
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.pending, 0);
        assert_eq!(state.failed, 1);
        assert_eq!(
            alice.sync.conversation(c.id).unwrap().sync_status,
            SyncStatus::Failed
        );
        let held = &alice.sync.messages(c.id).unwrap()[0];
        assert_eq!(held.sync_status, SyncStatus::Failed);
        assert_eq!(held.retry_count, 0);

        remote.set_reachable(true);
        let retried = alice.sync.retry_message(m.id).unwrap();
        assert_eq!(retried.sync_status, SyncStatus::Pending);
        assert_eq!(
            alice.sync.conversation(c.id).unwrap().sync_status,
            SyncStatus::Pending
        );

        let report = alice.sync.drain_now().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(remote.conversation(c.id).is_some());
        assert_eq!(
            alice.sync.messages(c.id).unwrap()[0].sync_status,
            SyncStatus::Synced
        );
        let state = alice.sync.current_state();
        assert_eq!((state.pending, state.failed), (0, 0));
    }

    #[tokio::test]
    async fn retry_is_refused_at_the_lifetime_cap() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, false);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        let m = alice.sync.send_message(c.id, "hello").unwrap();
        alice
            .sync
            .inner
            .store
            .lock()
            .unwrap()
            .update_message(m.id, |m| {
                m.sync_status = SyncStatus::Failed;
                m.retry_count = 10;
                m.attempt_ceiling = 10;
            })
            .unwrap();

        assert!(matches!(
            alice.sync.retry_message(m.id),
            Err(SyncError::RetryLimitReached { attempts: 10, .. })
        ));
        assert_eq!(alice.sync.retry_conversation(c.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn only_failed_messages_can_be_discarded() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        alice.sync.drain_now().await.unwrap();

        let first = alice.sync.send_message(c.id, "first").unwrap();
        assert!(matches!(
            alice.sync.discard_message(first.id),
            Err(SyncError::InvalidState(_))
        ));
        alice.sync.send_message(c.id, "second").unwrap();

        remote.fail_next([DeliveryError::rejected(
            courier_shared::RejectionKind::Malformed,
            "bad",
        )]);
        alice.sync.drain_now().await.unwrap();

        let (rejected, delivered): (Vec<Message>, Vec<Message>) = alice
            .sync
            .messages(c.id)
            .unwrap()
            .into_iter()
            .partition(|m| m.rejected);
        assert_eq!(rejected.len(), 1);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].sync_status, SyncStatus::Synced);
        assert!(matches!(
            alice.sync.discard_message(delivered[0].id),
            Err(SyncError::InvalidState(_))
        ));

        alice.sync.discard_message(rejected[0].id).unwrap();
        let left: Vec<MessageId> = alice.sync.messages(c.id).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(left, vec![delivered[0].id]);
        assert_eq!(
            alice.sync.conversation(c.id).unwrap().last_message_id,
            Some(delivered[0].id)
        );
        assert_eq!(alice.sync.current_state().failed, 0);
    }

    #[tokio::test]
    async fn writes_require_a_signed_in_participant() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, false);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();

        alice.credentials.set(Some(UserId::from("mallory")));
        assert!(matches!(
            alice.sync.send_message(c.id, "hi"),
            Err(SyncError::Validation(courier_shared::ValidationError::NotParticipant))
        ));

        alice.credentials.set(None);
        assert!(matches!(
            alice.sync.send_message(c.id, "hi"),
            Err(SyncError::NotSignedIn)
        ));
        assert!(matches!(
            alice.sync.send_message(ConversationId::new(), "hi"),
            Err(SyncError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn system_messages_stay_local_and_update_the_preview() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob"), UserId::from("carol")], Some("Trip".into()))
            .unwrap();
        assert_eq!(c.display_name.as_deref(), Some("Trip"));

        alice.sync.post_system_message(c.id, "carol joined").unwrap();
        alice.sync.drain_now().await.unwrap();

        assert_eq!(remote.send_calls(), 0);
        let conversation = alice.sync.conversation(c.id).unwrap();
        assert_eq!(conversation.last_message_text.as_deref(), Some("carol joined"));
        assert_eq!(conversation.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn conversation_flags_and_deletion() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, false);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();

        assert!(alice.sync.set_pinned(c.id, true).unwrap().pinned);
        assert!(alice.sync.set_muted(c.id, true).unwrap().muted);
        alice.sync.set_archived(c.id, true).unwrap();
        assert!(alice.sync.conversations(false).unwrap().is_empty());
        assert_eq!(alice.sync.conversations(true).unwrap().len(), 1);

        alice.sync.send_message(c.id, "bye").unwrap();
        assert!(alice.sync.delete_conversation(c.id).await.unwrap());
        assert!(matches!(
            alice.sync.set_pinned(c.id, false),
            Err(SyncError::UnknownConversation(_))
        ));
        assert_eq!(alice.sync.current_state().pending, 0);
    }

    #[tokio::test]
    async fn gap_signal_then_resync_clears_it() {
        let remote = Arc::new(MemoryRemote::new());
        let alice = device("alice", &remote, true);
        let c = alice
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        alice.sync.drain_now().await.unwrap();
        let mut signals = alice.sync.signals();

        for n in 1..=3 {
            remote.deliver_from_peer(peer_message(c.id, &format!("m{n}"))).unwrap();
        }
        alice.sync.resync_conversation(c.id).await.unwrap();
        let _ = signals.try_recv();

        alice.sync.open_conversation(c.id).await.unwrap();
        // Sequence 4 is accepted while nobody listens for it.
        alice.sync.close_conversation(c.id).await.unwrap();
        remote.deliver_from_peer(peer_message(c.id, "m4")).unwrap();
        alice.sync.open_conversation(c.id).await.unwrap();
        remote.deliver_from_peer(peer_message(c.id, "m5")).unwrap();

        eventually(|| alice.sync.conversation(c.id).unwrap().sequence_gap).await;
        assert_eq!(
            signals.recv().await.unwrap(),
            SyncSignal::SequenceGap {
                conversation_id: c.id,
                expected: 4,
                received: 5
            }
        );
        assert_eq!(alice.sync.messages(c.id).unwrap().len(), 4);

        assert_eq!(alice.sync.resync_conversation(c.id).await.unwrap(), 1);
        let conversation = alice.sync.conversation(c.id).unwrap();
        assert!(!conversation.sequence_gap);
        assert_eq!(conversation.highest_sequence, Some(5));
        assert_eq!(alice.sync.messages(c.id).unwrap().len(), 5);
    }
}
