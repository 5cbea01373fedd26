//! Bounded per-chunk retry with exponential backoff.
//!
//! Only retryable errors (see [`UploadError::is_retryable`]) are retried.
//! Before every retry the server offset is re-read with HEAD, so a chunk
//! whose acknowledgment was lost is recognized as committed instead of
//! being resent into a 409.

use crate::{
    client::{client::TusClient, source::SourceHandle},
    errors::UploadError,
    models::stats::StatsTracker,
};
use reqwest::Url;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(1),
        }
    }

    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// `base_delay * 2^attempt`, attempt counted from 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(31))
    }
}

impl TusClient {
    /// Send the chunk `[offset, offset + len)` under the client's retry policy.
    ///
    /// Returns the server-confirmed offset, or `None` when the source had no
    /// bytes left at `offset`.
    pub(crate) async fn send_chunk_with_retry(
        &self,
        handle: &mut SourceHandle<'_>,
        url: &Url,
        offset: u64,
        len: usize,
        stats: &StatsTracker,
    ) -> Result<Option<u64>, UploadError> {
        let policy = self.config().retry;
        let mut attempt: u32 = 0;
        loop {
            match self.attempt_chunk(handle, url, offset, len, attempt > 0).await {
                Ok(confirmed) => {
                    if attempt > 0 {
                        stats.chunk_retried();
                        info!(
                            "chunk at offset {} succeeded after {} attempts",
                            offset,
                            attempt + 1
                        );
                    }
                    return Ok(confirmed);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "chunk at offset {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        offset,
                        attempt + 1,
                        policy.max_retries + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() && policy.max_retries > 0 => {
                    warn!(
                        "chunk at offset {} failed after {} attempts",
                        offset,
                        attempt + 1
                    );
                    return Err(UploadError::Failed {
                        offset,
                        attempts: attempt + 1,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_chunk(
        &self,
        handle: &mut SourceHandle<'_>,
        url: &Url,
        offset: u64,
        len: usize,
        resync: bool,
    ) -> Result<Option<u64>, UploadError> {
        let data = handle.read_at(offset, len).await?;
        if data.is_empty() {
            return Ok(None);
        }

        if resync {
            let server_offset = self.head_offset(url).await?;
            let end = offset + data.len() as u64;
            if server_offset == end {
                info!("chunk at offset {} was already committed", offset);
                return Ok(Some(end));
            }
            if server_offset != offset {
                return Err(UploadError::OffsetConflict {
                    offset,
                    server_offset: Some(server_offset),
                });
            }
        }

        self.upload_chunk_at(url, offset, data).await.map(Some)
    }
}
