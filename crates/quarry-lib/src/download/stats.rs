use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters for the download service. All updates are relaxed; the
/// snapshot is advisory, not a synchronization point.
#[derive(Debug, Default)]
pub struct DownloadStats {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_downloaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Point-in-time view of the service counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_downloaded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl DownloadStats {
    pub fn task_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self, bytes: u64) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counters_balance() {
        let stats = DownloadStats::default();
        stats.task_started();
        stats.task_started();
        stats.task_completed(1024);
        stats.task_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.bytes_downloaded, 1024);
    }

    #[test]
    fn cache_counters_are_independent() {
        let stats = DownloadStats::default();
        stats.cache_hit();
        stats.cache_miss();
        stats.cache_miss();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 2);
    }
}
