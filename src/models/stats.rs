//! Client-side progress statistics for one upload attempt.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Point-in-time copy of an upload's progress.
#[derive(Clone, Copy, Debug)]
pub struct UploadStats {
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub chunks_retried: u64,
    pub start_time: Instant,
}

impl UploadStats {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            uploaded_bytes: 0,
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_retried: 0,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Bytes per second since `start_time`; zero before any time has passed.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.uploaded_bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn throughput_mib(&self) -> f64 {
        self.throughput() / (1024.0 * 1024.0)
    }

    /// Completion in the range 0..=100. Zero-length uploads report 0.
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes > 0 {
            self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Estimated time to completion, zero while throughput is unknown and
    /// saturating at [`Duration::MAX`].
    pub fn eta(&self) -> Duration {
        let speed = self.throughput();
        if speed > 0.0 {
            let remaining = self.total_bytes.saturating_sub(self.uploaded_bytes);
            Duration::try_from_secs_f64(remaining as f64 / speed).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.chunks_completed + self.chunks_failed
    }
}

/// Shared, mutex-guarded stats. Readers only ever get copies.
#[derive(Clone, Debug)]
pub struct StatsTracker {
    inner: Arc<Mutex<UploadStats>>,
}

impl StatsTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(UploadStats::new(total_bytes))),
        }
    }

    pub fn snapshot(&self) -> UploadStats {
        *self.lock()
    }

    pub fn chunk_completed(&self, offset: u64) {
        let mut stats = self.lock();
        stats.uploaded_bytes = offset;
        stats.chunks_completed += 1;
    }

    pub fn chunk_failed(&self) {
        self.lock().chunks_failed += 1;
    }

    pub fn chunk_retried(&self) {
        self.lock().chunks_retried += 1;
    }

    /// Overwrite the uploaded byte count with a server-confirmed offset.
    pub fn sync_offset(&self, offset: u64) {
        self.lock().uploaded_bytes = offset;
    }

    fn lock(&self) -> MutexGuard<'_, UploadStats> {
        // A panicking progress callback cannot corrupt plain counters.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
