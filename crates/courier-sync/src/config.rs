//! Tuning knobs of the sync core.
//!
//! The retry cap and backoff are product decisions, not architecture, so
//! every one of them is configurable.  Defaults live in
//! [`courier_shared::constants`].

use std::time::Duration;

use courier_shared::constants::{DEFAULT_DRAIN_INTERVAL_SECS, DEFAULT_SEND_TIMEOUT_SECS};

use crate::policy::RetryPolicy;

/// Sync core configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempt cap and backoff schedule for outbound deliveries.
    pub retry: RetryPolicy,

    /// Upper bound for a single remote send; a timeout counts as a transient
    /// failure.
    pub send_timeout: Duration,

    /// Interval of the periodic drain while online.
    pub drain_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            drain_interval: Duration::from_secs(DEFAULT_DRAIN_INTERVAL_SECS),
        }
    }
}
