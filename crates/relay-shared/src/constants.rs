/// Application name
pub const APP_NAME: &str = "Relay";

/// Width of one history bucket in milliseconds (one day)
pub const DEFAULT_BUCKET_RANGE_MS: u64 = 1000 * 60 * 60 * 24;

/// Minimum number of messages a single page load tries to bring in
pub const DEFAULT_TARGET_MESSAGES_COUNT: usize = 20;

/// Timeout applied to every backend call, in seconds
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;

/// Attachment downloads are attempted at most this many times
pub const ATTACHMENT_MAX_ATTEMPTS: u32 = 10;

/// Delay before the first attachment download retry, in milliseconds
pub const ATTACHMENT_INITIAL_BACKOFF_MS: u64 = 1000;

/// Multiplier applied to the retry delay after every failed attempt
pub const ATTACHMENT_BACKOFF_FACTOR: u32 = 2;

/// Capacity of the per-conversation event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
