/// Application name
pub const APP_NAME: &str = "Courier";

/// Automatic delivery attempts per message before it is marked failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifetime attempt cap, reachable only through manual retries
pub const DEFAULT_MANUAL_RETRY_CAP: u32 = 10;

/// Backoff before the second attempt, in milliseconds
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for a single backoff delay, in milliseconds
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Relative jitter applied to every backoff delay (0.2 = ±20%)
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Timeout for a single remote send, in seconds
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 5;

/// Interval of the periodic queue drain, in seconds
pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 30;

/// Buffered remote events per conversation subscription
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Maximum message body size in bytes (16 KiB)
pub const MAX_BODY_LEN: usize = 16 * 1024;

/// Minimum participants in any conversation
pub const MIN_PARTICIPANTS: usize = 2;
