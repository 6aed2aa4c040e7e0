//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.  It also owns the
//! broadcast channel through which committed changes are announced to
//! observers (see [`crate::events`]).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;
use tokio::sync::broadcast;

use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::migrations;

/// Buffered store events per observer before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

const DB_FILE_NAME: &str = "courier.db";

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    events: broadcast::Sender<StoreEvent>,
}

impl Database {
    /// Location of the application database in the platform data directory:
    /// - Linux:   `~/.local/share/courier/courier.db`
    /// - macOS:   `~/Library/Application Support/com.courier.courier/courier.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\courier\courier\data\courier.db`
    ///
    /// Nothing is created here; [`Database::open_at`] creates missing parent
    /// directories.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "courier", "courier").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join(DB_FILE_NAME))
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self { conn, events })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Observe committed changes.
    ///
    /// Every mutation announces itself before returning to its caller, so a
    /// receiver obtained here sees a local write as soon as the write call
    /// completes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: StoreEvent) {
        // No receivers is the normal state when nothing is observing.
        let _ = self.events.send(event);
    }
}
