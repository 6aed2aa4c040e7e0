//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts with zero configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::UserId;
use courier_store::Database;
use courier_sync::SyncConfig;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SQLite database file.
    /// Env: `COURIER_DB_PATH`
    /// Default: `courier.db` in the platform data directory.
    pub db_path: PathBuf,

    /// Signed-in user, if any.
    /// Env: `COURIER_USER_ID`
    pub user_id: Option<UserId>,

    /// Retry policy, send timeout and drain interval.
    /// Env: `COURIER_MAX_ATTEMPTS`, `COURIER_MANUAL_RETRY_CAP`,
    /// `COURIER_BACKOFF_BASE_MS`, `COURIER_BACKOFF_MAX_MS`,
    /// `COURIER_SEND_TIMEOUT_SECS`, `COURIER_DRAIN_INTERVAL_SECS`
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_id: None,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("COURIER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(user) = std::env::var("COURIER_USER_ID") {
            let user = user.trim();
            if user.is_empty() {
                tracing::warn!("Empty COURIER_USER_ID, starting signed out");
            } else {
                config.user_id = Some(UserId::new(user));
            }
        }

        let retry = &mut config.sync.retry;
        if let Some(n) = parse_var::<u32>("COURIER_MAX_ATTEMPTS") {
            if n == 0 {
                tracing::warn!("COURIER_MAX_ATTEMPTS must be at least 1, using default");
            } else {
                retry.max_attempts = n;
            }
        }
        if let Some(n) = parse_var::<u32>("COURIER_MANUAL_RETRY_CAP") {
            retry.manual_retry_cap = n;
        }
        if let Some(ms) = parse_var::<u64>("COURIER_BACKOFF_BASE_MS") {
            retry.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("COURIER_BACKOFF_MAX_MS") {
            retry.backoff_max = Duration::from_millis(ms);
        }
        if retry.manual_retry_cap < retry.max_attempts {
            tracing::warn!(
                cap = retry.manual_retry_cap,
                max_attempts = retry.max_attempts,
                "Manual retry cap below max attempts, raising it"
            );
            retry.manual_retry_cap = retry.max_attempts;
        }

        if let Some(secs) = parse_var::<u64>("COURIER_SEND_TIMEOUT_SECS") {
            config.sync.send_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("COURIER_DRAIN_INTERVAL_SECS") {
            config.sync.drain_interval = Duration::from_secs(secs.max(1));
        }

        config
    }
}

/// Read and parse one variable.  Unparsable values are logged and ignored.
fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

fn default_db_path() -> PathBuf {
    Database::default_path().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "No platform data directory, using ./courier.db");
        PathBuf::from("courier.db")
    })
}
