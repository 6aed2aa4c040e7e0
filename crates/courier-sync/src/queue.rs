//! Outbound delivery of locally written records.
//!
//! There is no queue table: the queue is whatever the store reports as
//! deliverable.  A drain groups it by conversation, delivers each group in
//! order and the groups concurrently.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use courier_shared::types::now_millis;
use courier_shared::{ConversationId, DeliveryError, MessageId, SyncStatus};
use courier_store::{Conversation, Message, StoreError};

use crate::config::SyncConfig;
use crate::connectivity::wait_offline;
use crate::error::Result;
use crate::reconcile::{ReconciliationEngine, SyncSignal};
use crate::remote::RemoteHandle;
use crate::{lock_store, SharedStore};

/// Tally of one drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// Ran out of automatic attempts.
    pub failed: usize,
    /// Permanently rejected by the remote store.
    pub rejected: usize,
    /// Left pending for a later drain.
    pub deferred: usize,
    /// Connectivity was lost while draining.
    pub interrupted: bool,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.rejected += other.rejected;
        self.deferred += other.deferred;
        self.interrupted |= other.interrupted;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Failed,
    Rejected,
    Interrupted,
    /// Discarded or already reconciled while queued.
    Skipped,
}

struct Group {
    /// Conversation record still waiting for its first push.
    pending_record: Option<Conversation>,
    /// The conversation record already failed; its messages cannot go out.
    blocked: bool,
    messages: Vec<Message>,
}

pub struct OutboundQueue {
    store: SharedStore,
    remote: RemoteHandle,
    reconciler: Arc<ReconciliationEngine>,
    config: SyncConfig,
    signals: broadcast::Sender<SyncSignal>,
}

impl OutboundQueue {
    pub fn new(
        store: SharedStore,
        remote: RemoteHandle,
        reconciler: Arc<ReconciliationEngine>,
        config: SyncConfig,
        signals: broadcast::Sender<SyncSignal>,
    ) -> Self {
        Self {
            store,
            remote,
            reconciler,
            config,
            signals,
        }
    }

    /// Deliver everything currently deliverable.  Returns once every group
    /// has finished or given up; storage failures are returned after all
    /// groups are done.
    pub async fn drain(&self, online: watch::Receiver<bool>) -> Result<DrainReport> {
        if !*online.borrow() {
            return Ok(DrainReport {
                interrupted: true,
                ..DrainReport::default()
            });
        }

        let groups = self.collect()?;
        if groups.is_empty() {
            return Ok(DrainReport::default());
        }
        debug!(conversations = groups.len(), "draining outbound queue");

        let results = join_all(
            groups
                .into_iter()
                .map(|(id, group)| self.deliver_group(id, group, online.clone())),
        )
        .await;

        let mut report = DrainReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(group_report) => report.merge(group_report),
                Err(e) => {
                    warn!(error = %e, "conversation drain aborted");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            delivered = report.delivered,
            failed = report.failed,
            rejected = report.rejected,
            deferred = report.deferred,
            "drain finished"
        );
        Ok(report)
    }

    fn collect(&self) -> Result<BTreeMap<ConversationId, Group>> {
        let db = lock_store(&self.store)?;
        let mut groups: BTreeMap<ConversationId, Group> = BTreeMap::new();

        for conversation in db.pending_conversations()? {
            groups.insert(
                conversation.id,
                Group {
                    pending_record: Some(conversation),
                    blocked: false,
                    messages: Vec::new(),
                },
            );
        }

        for message in db.deliverable_messages()? {
            if !groups.contains_key(&message.conversation_id) {
                let blocked = match db.find_conversation(message.conversation_id)? {
                    Some(c) => c.sync_status == SyncStatus::Failed,
                    None => true,
                };
                groups.insert(
                    message.conversation_id,
                    Group {
                        pending_record: None,
                        blocked,
                        messages: Vec::new(),
                    },
                );
            }
            if let Some(group) = groups.get_mut(&message.conversation_id) {
                group.messages.push(message);
            }
        }

        Ok(groups)
    }

    async fn deliver_group(
        &self,
        conversation_id: ConversationId,
        group: Group,
        mut online: watch::Receiver<bool>,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if group.blocked {
            report.failed = self.fail_held_messages(conversation_id, &group.messages)?;
            return Ok(report);
        }

        if let Some(conversation) = group.pending_record {
            match self.push_conversation(conversation, &mut online).await? {
                Delivery::Delivered | Delivery::Skipped => {}
                Delivery::Interrupted => {
                    debug!(conversation = %conversation_id, "conversation push interrupted, holding messages");
                    report.interrupted = true;
                    report.deferred = group.messages.len();
                    return Ok(report);
                }
                Delivery::Failed | Delivery::Rejected => {
                    report.failed = self.fail_held_messages(conversation_id, &group.messages)?;
                    return Ok(report);
                }
            }
        }

        let total = group.messages.len();
        for (index, message) in group.messages.into_iter().enumerate() {
            match self.deliver_message(message, &mut online).await? {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed => report.failed += 1,
                Delivery::Rejected => report.rejected += 1,
                Delivery::Skipped => {}
                Delivery::Interrupted => {
                    report.interrupted = true;
                    report.deferred += total - index;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// One send attempt, bounded by the send timeout and abandoned if
    /// connectivity drops while it is in flight.
    async fn attempt<T, Fut>(
        &self,
        online: &mut watch::Receiver<bool>,
        call: Fut,
    ) -> std::result::Result<T, DeliveryError>
    where
        Fut: Future<Output = std::result::Result<T, DeliveryError>>,
    {
        let timeout = self.config.send_timeout;
        tokio::select! {
            _ = wait_offline(online) => Err(DeliveryError::Interrupted),
            result = tokio::time::timeout(timeout, call) => {
                result.unwrap_or(Err(DeliveryError::Timeout(timeout)))
            }
        }
    }

    /// Backoff sleep that gives up early when connectivity drops.
    /// Returns `false` if interrupted.
    async fn backoff(&self, failed_attempts: u32, online: &mut watch::Receiver<bool>) -> bool {
        let delay = self.config.retry.delay_for(failed_attempts);
        debug!(?delay, failed_attempts, "backing off");
        tokio::select! {
            _ = wait_offline(online) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn deliver_message(
        &self,
        message: Message,
        online: &mut watch::Receiver<bool>,
    ) -> Result<Delivery> {
        let id = message.id;

        loop {
            if !*online.borrow() {
                return Ok(Delivery::Interrupted);
            }

            let Some(current) = self.touch_message(id)? else {
                return Ok(Delivery::Skipped);
            };
            if !current.is_deliverable() {
                return Ok(Delivery::Skipped);
            }

            let wire = current.to_remote();
            let err = match self.attempt(online, self.remote.send(&wire)).await {
                Ok(ack) => {
                    self.reconciler.apply_ack(id, &ack)?;
                    info!(msg_id = %id, conversation = %current.conversation_id, "message delivered");
                    return Ok(Delivery::Delivered);
                }
                Err(err) => err,
            };

            let permanent = !err.is_retryable();
            let Some(after) = self.record_message_failure(id, &err, permanent)? else {
                return Ok(Delivery::Skipped);
            };

            match after.sync_status {
                SyncStatus::Synced => return Ok(Delivery::Delivered),
                SyncStatus::Failed => {
                    warn!(
                        msg_id = %id,
                        attempts = after.retry_count,
                        rejected = after.rejected,
                        error = %err,
                        "message delivery failed"
                    );
                    let _ = self.signals.send(SyncSignal::MessageFailed {
                        conversation_id: after.conversation_id,
                        message_id: id,
                        reason: err.to_string(),
                        rejected: after.rejected,
                    });
                    return Ok(if after.rejected {
                        Delivery::Rejected
                    } else {
                        Delivery::Failed
                    });
                }
                SyncStatus::Pending => {
                    debug!(msg_id = %id, attempts = after.retry_count, error = %err, "transient delivery failure");
                    if err == DeliveryError::Interrupted
                        || !self.backoff(after.retry_count, online).await
                    {
                        return Ok(Delivery::Interrupted);
                    }
                }
            }
        }
    }

    /// Stamp the attempt time and return the fresh record, or `None` if the
    /// message was discarded meanwhile.
    fn touch_message(&self, id: MessageId) -> Result<Option<Message>> {
        let mut db = lock_store(&self.store)?;
        match db.update_message(id, |m| m.last_sync_attempt = Some(now_millis())) {
            Ok(m) => Ok(Some(m)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record_message_failure(
        &self,
        id: MessageId,
        err: &DeliveryError,
        permanent: bool,
    ) -> Result<Option<Message>> {
        let mut db = lock_store(&self.store)?;
        let result = db.update_message(id, |m| {
            // An echo from the subscription may have reconciled it already.
            if m.sync_status == SyncStatus::Synced {
                return;
            }
            m.last_sync_error = Some(err.to_string());
            if permanent {
                m.sync_status = SyncStatus::Failed;
                m.rejected = true;
            } else {
                m.retry_count += 1;
                m.sync_status = if m.retries_exhausted() {
                    SyncStatus::Failed
                } else {
                    SyncStatus::Pending
                };
            }
        });
        match result {
            Ok(m) => Ok(Some(m)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Messages behind a failed conversation record cannot go out until the
    /// record does.  Mark them failed so they surface with a retry option;
    /// their own attempt budget is left untouched.  Returns how many moved.
    fn fail_held_messages(
        &self,
        conversation_id: ConversationId,
        messages: &[Message],
    ) -> Result<usize> {
        let mut failed = Vec::new();
        {
            let mut db = lock_store(&self.store)?;
            let cause = db
                .find_conversation(conversation_id)?
                .and_then(|c| c.last_sync_error)
                .unwrap_or_else(|| "unknown error".to_string());
            let reason = format!("conversation could not be created: {cause}");

            for message in messages {
                let result = db.update_message(message.id, |m| {
                    if m.sync_status == SyncStatus::Pending {
                        m.sync_status = SyncStatus::Failed;
                        m.rejected = false;
                        m.last_sync_error = Some(reason.clone());
                    }
                });
                match result {
                    Ok(m) if m.sync_status == SyncStatus::Failed => failed.push(m.id),
                    Ok(_) | Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            for &message_id in &failed {
                warn!(msg_id = %message_id, conversation = %conversation_id, "message held by failed conversation");
                let _ = self.signals.send(SyncSignal::MessageFailed {
                    conversation_id,
                    message_id,
                    reason: reason.clone(),
                    rejected: false,
                });
            }
        }
        Ok(failed.len())
    }

    async fn push_conversation(
        &self,
        conversation: Conversation,
        online: &mut watch::Receiver<bool>,
    ) -> Result<Delivery> {
        let id = conversation.id;
        let record = conversation.to_remote();

        loop {
            if !*online.borrow() {
                return Ok(Delivery::Interrupted);
            }

            let result = self
                .attempt(online, self.remote.create_conversation(&record))
                .await;
            let max_attempts = self.config.retry.max_attempts;

            let after = {
                let mut db = lock_store(&self.store)?;
                let updated = match &result {
                    Ok(()) => db.update_conversation(id, |c| {
                        c.sync_status = SyncStatus::Synced;
                        c.last_sync_attempt = Some(now_millis());
                        c.last_sync_error = None;
                    }),
                    Err(err) => db.update_conversation(id, |c| {
                        c.last_sync_attempt = Some(now_millis());
                        c.last_sync_error = Some(err.to_string());
                        if err.is_retryable() {
                            c.retry_count += 1;
                            if c.retry_count >= max_attempts {
                                c.sync_status = SyncStatus::Failed;
                            }
                        } else {
                            c.sync_status = SyncStatus::Failed;
                        }
                    }),
                };
                updated
            };

            let after = match after {
                Ok(c) => c,
                Err(StoreError::NotFound) => return Ok(Delivery::Skipped),
                Err(e) => return Err(e.into()),
            };

            let err = match result {
                Ok(()) => {
                    info!(conversation = %id, "conversation record pushed");
                    return Ok(Delivery::Delivered);
                }
                Err(err) => err,
            };

            if after.sync_status == SyncStatus::Failed {
                warn!(conversation = %id, attempts = after.retry_count, error = %err, "conversation push failed");
                return Ok(if err.is_retryable() {
                    Delivery::Failed
                } else {
                    Delivery::Rejected
                });
            }
            if err == DeliveryError::Interrupted || !self.backoff(after.retry_count, online).await {
                return Ok(Delivery::Interrupted);
            }
        }
    }
}
