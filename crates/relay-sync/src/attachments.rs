//! Attachment download with retry.
//!
//! Freshly committed entries are often visible before the blobs they point
//! to have replicated, so downloads are retried with exponential backoff
//! before an image is marked as failed.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use relay_shared::EntryHandle;

use crate::backend::{call_with_timeout, Backend};
use crate::config::SyncConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.attachment_max_attempts.max(1),
            initial_backoff: config.attachment_initial_backoff,
            factor: config.attachment_backoff_factor,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.saturating_pow(exponent);
        self.initial_backoff.saturating_mul(multiplier)
    }
}

/// Download `handle`, retrying on errors and timeouts.
pub async fn download_with_retry(
    backend: &dyn Backend,
    handle: &EntryHandle,
    policy: RetryPolicy,
    call_timeout: Duration,
) -> Result<Bytes, SyncError> {
    let mut attempt = 1;
    loop {
        let result = call_with_timeout(
            "download_attachment",
            call_timeout,
            backend.download_attachment(handle),
        )
        .await;

        match result {
            Ok(bytes) => {
                tracing::debug!(handle = %handle, attempt, "attachment downloaded");
                return Ok(bytes);
            }
            Err(e) if attempt >= policy.max_attempts => {
                tracing::warn!(handle = %handle, attempt, error = %e, "giving up on attachment");
                return Err(SyncError::AttachmentUnavailable {
                    handle: handle.clone(),
                    attempts: attempt,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    handle = %handle,
                    attempt,
                    retry_in = ?delay,
                    error = %e,
                    "attachment not available yet"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Render bytes as a `data:` URL.
pub fn data_url(file_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", file_type, STANDARD.encode(bytes))
}
