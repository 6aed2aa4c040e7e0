//! Sync core of Courier: the outbound queue, the remote boundary, the
//! reconciliation engine and the coordinator that ties them together.
//!
//! Every component takes its collaborators in its constructor.  The local
//! store is shared as a [`SharedStore`] and locked for one store operation at
//! a time, never across an `.await`.

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod credentials;
mod error;
pub mod memory;
pub mod policy;
pub mod queue;
pub mod reconcile;
pub mod remote;

use std::sync::{Arc, Mutex, MutexGuard};

use courier_store::Database;

pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use coordinator::{SyncCoordinator, SyncPhase, SyncState};
pub use credentials::{CredentialProvider, StaticCredentials};
pub use error::{Result, SyncError};
pub use memory::MemoryRemote;
pub use policy::RetryPolicy;
pub use queue::{DrainReport, OutboundQueue};
pub use reconcile::{MergeOutcome, ReconciliationEngine, SyncSignal};
pub use remote::{RemoteHandle, RemoteSyncClient};

/// The single store handle of a process.
pub type SharedStore = Arc<Mutex<Database>>;

pub fn share(db: Database) -> SharedStore {
    Arc::new(Mutex::new(db))
}

pub(crate) fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, Database>> {
    store.lock().map_err(|_| SyncError::LockPoisoned)
}
