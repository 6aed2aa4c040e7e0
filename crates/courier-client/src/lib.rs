pub mod config;
pub mod events;
pub mod state;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use courier_sync::RemoteHandle;

use crate::config::ClientConfig;
use crate::events::{event_name, SignalPayload, SyncStatePayload, EVENT_SYNC_SIGNAL, EVENT_SYNC_STATE_CHANGED};
use crate::state::ClientState;

/// Install the global tracing subscriber.  `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("courier_client=debug,courier_sync=debug,courier_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Open the client state and start the coordinator loop and the UI event
/// bridge.
pub fn start(config: ClientConfig, remote: RemoteHandle) -> anyhow::Result<(ClientState, Vec<JoinHandle<()>>)> {
    info!("Starting Courier client v{}", env!("CARGO_PKG_VERSION"));

    let state = ClientState::open(config, remote).context("failed to open client state")?;
    let coordinator = state.sync.start();
    let bridge = spawn_event_bridge(&state)?;

    Ok((state, vec![coordinator, bridge]))
}

/// Forward store changes, sync state and sync signals to the UI layer as
/// named events with serialized payloads.
pub fn spawn_event_bridge(state: &ClientState) -> anyhow::Result<JoinHandle<()>> {
    let mut store_events = state.sync.store_events()?;
    let mut sync_state = state.sync.state();
    let mut signals = state.sync.signals();

    Ok(tokio::spawn(async move {
        info!("UI event bridge started");
        loop {
            tokio::select! {
                event = store_events.recv() => match event {
                    Ok(event) => emit_event(event_name(&event), &event),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "UI bridge lagging behind store"),
                    Err(RecvError::Closed) => break,
                },
                changed = sync_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let payload = SyncStatePayload::from(*sync_state.borrow_and_update());
                    emit_event(EVENT_SYNC_STATE_CHANGED, &payload);
                }
                signal = signals.recv() => match signal {
                    Ok(signal) => emit_event(EVENT_SYNC_SIGNAL, &SignalPayload::from(signal)),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "UI bridge lagging behind signals"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        warn!("UI event bridge ended");
    }))
}

/// Hand an event to the UI.  Without a UI attached the event is logged.
pub fn emit_event<S: serde::Serialize>(event: &str, payload: &S) {
    match serde_json::to_string(payload) {
        Ok(json) => debug!(event, payload = %json, "ui event"),
        Err(e) => tracing::error!(event, error = %e, "Failed to serialize event"),
    }
}
