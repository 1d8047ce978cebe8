//! Sync engine configuration loaded from environment variables.
//!
//! Every setting has a default matching the deployed client, so an engine
//! can be built with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use relay_shared::constants::{
    ATTACHMENT_BACKOFF_FACTOR, ATTACHMENT_INITIAL_BACKOFF_MS, ATTACHMENT_MAX_ATTEMPTS,
    DEFAULT_BACKEND_TIMEOUT_SECS, DEFAULT_BUCKET_RANGE_MS, DEFAULT_TARGET_MESSAGES_COUNT,
};
use relay_store::Database;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Width of one history bucket in milliseconds.
    /// Env: `RELAY_BUCKET_RANGE_MS`
    /// Default: one day
    pub bucket_range_ms: u64,

    /// Minimum number of messages a page load tries to cover.
    /// Env: `RELAY_TARGET_MESSAGES_COUNT`
    /// Default: `20`
    pub target_messages_count: usize,

    /// Upper bound on every backend call.
    /// Env: `RELAY_BACKEND_TIMEOUT_SECS`
    /// Default: 30 seconds
    pub backend_timeout: Duration,

    /// Attempts made to download one attachment before giving up.
    /// Env: `RELAY_ATTACHMENT_MAX_ATTEMPTS`
    /// Default: `10`
    pub attachment_max_attempts: u32,

    /// Wait after the first failed download.
    /// Env: `RELAY_ATTACHMENT_BACKOFF_MS`
    /// Default: 1 second
    pub attachment_initial_backoff: Duration,

    /// Multiplier applied to the wait after each further failed download.
    /// Env: `RELAY_ATTACHMENT_BACKOFF_FACTOR`
    /// Default: `2`
    pub attachment_backoff_factor: u32,

    /// SQLite file holding bucket records. `None` uses the platform data dir.
    /// Env: `RELAY_STORE_PATH`
    pub store_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bucket_range_ms: DEFAULT_BUCKET_RANGE_MS,
            target_messages_count: DEFAULT_TARGET_MESSAGES_COUNT,
            backend_timeout: Duration::from_secs(DEFAULT_BACKEND_TIMEOUT_SECS),
            attachment_max_attempts: ATTACHMENT_MAX_ATTEMPTS,
            attachment_initial_backoff: Duration::from_millis(ATTACHMENT_INITIAL_BACKOFF_MS),
            attachment_backoff_factor: ATTACHMENT_BACKOFF_FACTOR,
            store_path: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "RELAY_BUCKET_RANGE_MS") {
            if ms > 0 {
                config.bucket_range_ms = ms;
            } else {
                tracing::warn!("RELAY_BUCKET_RANGE_MS must be positive, using default");
            }
        }

        if let Some(n) = parse_var(&lookup, "RELAY_TARGET_MESSAGES_COUNT") {
            config.target_messages_count = n;
        }

        if let Some(secs) = parse_var(&lookup, "RELAY_BACKEND_TIMEOUT_SECS") {
            config.backend_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = parse_var::<u32, _>(&lookup, "RELAY_ATTACHMENT_MAX_ATTEMPTS") {
            config.attachment_max_attempts = n.max(1);
        }

        if let Some(ms) = parse_var(&lookup, "RELAY_ATTACHMENT_BACKOFF_MS") {
            config.attachment_initial_backoff = Duration::from_millis(ms);
        }

        if let Some(factor) = parse_var::<u32, _>(&lookup, "RELAY_ATTACHMENT_BACKOFF_FACTOR") {
            config.attachment_backoff_factor = factor.max(1);
        }

        if let Some(path) = lookup("RELAY_STORE_PATH") {
            if !path.is_empty() {
                config.store_path = Some(PathBuf::from(path));
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter in `init_tracing`.

        config
    }

    /// Open the bucket store: `store_path` if set, else the platform default.
    pub fn open_store(&self) -> crate::Result<Database> {
        let db = match &self.store_path {
            Some(path) => Database::open_at(path)?,
            None => Database::open_default()?,
        };
        Ok(db)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
