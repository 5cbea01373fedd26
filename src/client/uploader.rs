//! Steppable transfer of one source into one existing upload.

use crate::{
    client::{
        client::{ProgressFn, TusClient},
        source::{SourceHandle, UploadSource},
    },
    errors::UploadError,
    models::stats::{StatsTracker, UploadStats},
};
use reqwest::Url;
use tracing::{debug, warn};

/// Chunk-by-chunk driver over an upload URL.
///
/// The offset only ever moves to a value the server reported, and the
/// stats are rewritten from it after each chunk. A path source is closed
/// when the uploader is dropped or [`closed`](Uploader::close); a borrowed
/// stream is left to its owner.
pub struct Uploader<'a> {
    client: TusClient,
    url: Url,
    handle: SourceHandle<'a>,
    offset: u64,
    stats: StatsTracker,
    exhausted: bool,
}

impl<'a> Uploader<'a> {
    pub async fn new(
        client: TusClient,
        source: UploadSource<'a>,
        upload_url: &str,
    ) -> Result<Self, UploadError> {
        let handle = source.open().await?;
        Self::from_handle(client, handle, upload_url).await
    }

    pub(crate) async fn from_handle(
        client: TusClient,
        mut handle: SourceHandle<'a>,
        upload_url: &str,
    ) -> Result<Self, UploadError> {
        let url = client.resolve(upload_url)?;
        let offset = client.head_offset(&url).await?;
        handle.seek_to(offset).await?;

        let stats = StatsTracker::new(handle.size());
        stats.sync_offset(offset);
        debug!("uploader for {} starts at offset {}", url, offset);
        Ok(Self {
            client,
            url,
            handle,
            offset,
            stats,
            exhausted: false,
        })
    }

    /// Send the next chunk. Returns whether bytes remain afterwards.
    pub async fn advance_one_chunk(&mut self) -> Result<bool, UploadError> {
        let size = self.handle.size();
        self.advance_until(size).await
    }

    /// Upload chunks until `stop_at` (or the end of the source) is reached.
    ///
    /// Returns the upload URL. A source that runs dry early ends the loop
    /// without an error; compare [`offset`](Self::offset) with
    /// [`size`](Self::size) when strict completion matters.
    pub async fn drive_to_completion(
        &mut self,
        progress: Option<&ProgressFn>,
        stop_at: Option<u64>,
    ) -> Result<String, UploadError> {
        let size = self.handle.size();
        let target = stop_at.map_or(size, |limit| limit.min(size));
        while self.offset < target {
            let more = self.advance_until(target).await?;
            if let Some(progress) = progress {
                progress(self.stats());
            }
            if !more || self.exhausted {
                break;
            }
        }
        Ok(self.url.to_string())
    }

    async fn advance_until(&mut self, target: u64) -> Result<bool, UploadError> {
        if self.offset >= target || self.exhausted {
            return Ok(false);
        }
        let remaining = target - self.offset;
        let len = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.client.config().chunk_size);

        let sent = self
            .client
            .send_chunk_with_retry(&mut self.handle, &self.url, self.offset, len, &self.stats)
            .await;
        match sent {
            Ok(Some(confirmed)) => {
                self.offset = confirmed;
                self.stats.chunk_completed(confirmed);
                Ok(self.offset < target)
            }
            Ok(None) => {
                warn!(
                    "source ended at {} before the declared size {}",
                    self.offset,
                    self.handle.size()
                );
                self.exhausted = true;
                Ok(false)
            }
            Err(err) => {
                self.stats.chunk_failed();
                Err(err)
            }
        }
    }

    /// Re-read the server offset, e.g. after a failed chunk.
    pub async fn sync(&mut self) -> Result<u64, UploadError> {
        let offset = self.client.head_offset(&self.url).await?;
        self.handle.seek_to(offset).await?;
        self.offset = offset;
        self.stats.sync_offset(offset);
        Ok(offset)
    }

    /// `(confirmed offset, total size)`.
    pub fn progress(&self) -> (u64, u64) {
        (self.offset, self.handle.size())
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.handle.size()
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.snapshot()
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.handle.size()
    }

    /// Release the source. Returns the final stats.
    pub fn close(self) -> UploadStats {
        self.stats.snapshot()
    }
}
