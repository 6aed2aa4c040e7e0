//! Client state shared by everything the UI layer calls into.
//!
//! [`ClientState`] owns the collaborators of the sync core and hands out a
//! [`SyncCoordinator`] for the actual operations.

use std::sync::Arc;

use courier_store::Database;
use courier_sync::{
    Connectivity, RemoteHandle, StaticCredentials, SyncCoordinator, SyncError,
};

use crate::config::ClientConfig;

pub struct ClientState {
    pub config: ClientConfig,

    /// Fed by the platform's reachability observer.
    pub connectivity: Connectivity,

    /// Updated by whatever performs sign-in and sign-out.
    pub credentials: Arc<StaticCredentials>,

    pub sync: SyncCoordinator,
}

impl ClientState {
    /// Open the local store and wire the sync core against `remote`.
    /// Starts offline; the coordinator loop is not running yet.
    pub fn open(config: ClientConfig, remote: RemoteHandle) -> Result<Self, SyncError> {
        let db = Database::open_at(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "database opened");

        let connectivity = Connectivity::new(false);
        let credentials = Arc::new(StaticCredentials::new(config.user_id.clone()));
        let sync = SyncCoordinator::new(
            courier_sync::share(db),
            remote,
            credentials.clone(),
            connectivity.subscribe(),
            config.sync.clone(),
        )?;

        Ok(Self {
            config,
            connectivity,
            credentials,
            sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{SyncStatus, UserId};
    use courier_sync::MemoryRemote;

    #[tokio::test]
    async fn open_wires_a_working_sync_core() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            db_path: dir.path().join("nested").join("client.db"),
            user_id: Some(UserId::from("alice")),
            ..ClientConfig::default()
        };
        let remote = Arc::new(MemoryRemote::new());
        let state = ClientState::open(config, remote.clone()).unwrap();
        assert!(!state.connectivity.is_online());

        let c = state
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .unwrap();
        state.sync.send_message(c.id, "hello").unwrap();
        assert_eq!(state.sync.current_state().pending, 1);

        state.connectivity.set_online(true);
        let report = state.sync.drain_now().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(
            state.sync.messages(c.id).unwrap()[0].sync_status,
            SyncStatus::Synced
        );
        assert_eq!(remote.messages(c.id).len(), 1);
    }

    #[tokio::test]
    async fn signed_out_client_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            db_path: dir.path().join("client.db"),
            ..ClientConfig::default()
        };
        let state = ClientState::open(config, Arc::new(MemoryRemote::new())).unwrap();
        assert!(matches!(
            state.sync.create_conversation(vec![UserId::from("bob")], None),
            Err(SyncError::NotSignedIn)
        ));

        state.credentials.set(Some(UserId::from("alice")));
        assert!(state
            .sync
            .create_conversation(vec![UserId::from("bob")], None)
            .is_ok());
    }
}
