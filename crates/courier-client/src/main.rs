//! # courier-client
//!
//! Demo driver for the Courier sync core.  Runs one offline/online round
//! trip against the in-process loopback remote:
//! - create a conversation and send a message while offline
//! - restore connectivity and wait for the queue to drain
//! - receive a reply through the conversation subscription and mark it read

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use courier_client::config::ClientConfig;
use courier_client::events::{ConversationDto, MessageDto};
use courier_shared::protocol::{ReadReceipts, RemoteMessage};
use courier_shared::types::now_millis;
use courier_shared::{DeliveryStatus, MessageId, UserId};
use courier_sync::{MemoryRemote, SyncPhase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_client::init_tracing();

    let mut config = ClientConfig::from_env();
    let me = config
        .user_id
        .get_or_insert_with(|| UserId::from("alice"))
        .clone();
    info!(?config, "Loaded configuration");

    let remote = Arc::new(MemoryRemote::new());
    let (state, tasks) = courier_client::start(config, remote.clone())?;

    // -----------------------------------------------------------------------
    // 1. Offline writes land locally and immediately
    // -----------------------------------------------------------------------
    let peer = UserId::from("bob");
    let conversation = state.sync.create_conversation(vec![peer.clone()], None)?;
    let message = state.sync.send_message(conversation.id, "hello from offline")?;
    info!(
        user = %me,
        msg_id = %message.id,
        status = message.sync_status.as_str(),
        "Message written locally"
    );

    // -----------------------------------------------------------------------
    // 2. Connectivity returns, the queue drains
    // -----------------------------------------------------------------------
    state.connectivity.set_online(true);

    let mut sync_state = state.sync.state();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = *sync_state.borrow_and_update();
            if current.phase == SyncPhase::Idle && current.pending == 0 {
                break;
            }
            if sync_state.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("timed out waiting for the outbound queue to drain")?;

    // -----------------------------------------------------------------------
    // 3. A reply arrives through the subscription
    // -----------------------------------------------------------------------
    state.sync.open_conversation(conversation.id).await?;
    remote
        .deliver_from_peer(RemoteMessage {
            id: MessageId::new(),
            conversation_id: conversation.id,
            sender_id: peer,
            body: "hi, got it".into(),
            local_created_at: now_millis(),
            server_timestamp: None,
            sequence: None,
            updated_at: None,
            delivery_status: DeliveryStatus::Sending,
            read_receipts: ReadReceipts::new(),
            is_system: false,
        })
        .context("loopback remote refused the reply")?;

    for _ in 0..50 {
        if state.sync.messages(conversation.id)?.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let read = state.sync.mark_conversation_read(conversation.id).await?;
    info!(count = read, "Marked conversation read");

    for m in state.sync.messages(conversation.id)? {
        println!("{}", serde_json::to_string(&MessageDto::from(m))?);
    }
    println!(
        "{}",
        serde_json::to_string(&ConversationDto::from(state.sync.conversation(conversation.id)?))?
    );

    state.sync.close_conversation(conversation.id).await?;
    for task in tasks {
        task.abort();
    }
    info!("Done");
    Ok(())
}
