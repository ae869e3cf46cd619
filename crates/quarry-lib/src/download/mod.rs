//! Download orchestration: in-flight deduplication, cache-first resolution,
//! bounded parallel fan-out and the missing-file sweep.

pub mod bandwidth;
pub mod engine;
pub mod retry;
pub mod stats;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::hash::{self, FileHash};
use crate::progress::{CancelToken, ProgressEvent, ProgressSink, Stage};

pub use bandwidth::BandwidthLimiter;
pub use engine::{DownloadEngine, FetchRequest};
pub use retry::RetryPolicy;
pub use stats::{DownloadStats, StatsSnapshot};

/// Advisory ordering within a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// One requested download.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    pub expected_hash: Option<FileHash>,
    pub priority: Priority,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            expected_hash: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_hash(mut self, expected: FileHash) -> Self {
        self.expected_hash = Some(expected);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub success: bool,
    pub url: String,
    pub path: PathBuf,
    pub size: u64,
    pub hash: Option<FileHash>,
    pub duration: Duration,
    pub from_cache: bool,
    pub error: Option<String>,
}

/// Outcome of a missing-file sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub downloaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

type SharedOutcome = std::result::Result<DownloadResult, Arc<Error>>;

/// Layer over the engine and the cache. One network fetch per URL at a time;
/// later callers for the same URL wait on the winner's result.
pub struct DownloadService {
    engine: DownloadEngine,
    cache: Arc<CacheStore>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<SharedOutcome>>>,
    stats: DownloadStats,
    max_parallel: usize,
}

impl DownloadService {
    pub fn new(engine: DownloadEngine, cache: Arc<CacheStore>, max_parallel: usize) -> Self {
        Self {
            engine,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            stats: DownloadStats::default(),
            max_parallel: max_parallel.clamp(1, 10),
        }
    }

    /// Startup self-check: drop corrupted cache entries before first use.
    pub async fn start(&self) -> Result<()> {
        self.cache.verify_integrity().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<BandwidthLimiter> {
        self.engine.limiter()
    }

    /// Fetch one file, deduplicating against any in-flight download of the
    /// same URL. Every caller ends up with the file at its own `dest`.
    pub async fn download_file(
        &self,
        task: &DownloadTask,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult> {
        // Join an in-flight download when one exists.
        let tx = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(tx) = in_flight.get(&task.url) {
                let mut rx = tx.subscribe();
                drop(in_flight);
                return self.follow(task, &mut rx).await;
            }
            let (tx, _) = broadcast::channel(8);
            in_flight.insert(task.url.clone(), tx.clone());
            tx
        };

        let outcome = self.perform(task, cancel, sink).await;

        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.remove(&task.url);
        }

        match outcome {
            Ok(result) => {
                let _ = tx.send(Ok(result.clone()));
                Ok(result)
            }
            Err(e) => {
                let shared = Arc::new(e);
                let _ = tx.send(Err(shared.clone()));
                Err(Error::Shared(shared))
            }
        }
    }

    /// Wait for the winner of a deduplicated download and mirror its file to
    /// this caller's destination.
    async fn follow(
        &self,
        task: &DownloadTask,
        rx: &mut broadcast::Receiver<SharedOutcome>,
    ) -> Result<DownloadResult> {
        let outcome = rx.recv().await.map_err(|_| Error::DownloadFailed {
            url: task.url.clone(),
            reason: "deduplicated download vanished before completing".into(),
        })?;
        let winner = outcome.map_err(Error::Shared)?;

        if winner.path != task.dest {
            if let Some(parent) = task.dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&winner.path, &task.dest).await?;
        }
        Ok(DownloadResult {
            path: task.dest.clone(),
            ..winner
        })
    }

    async fn perform(
        &self,
        task: &DownloadTask,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult> {
        self.stats.task_started();
        let result = self.perform_inner(task, cancel, sink).await;
        match &result {
            Ok(r) if r.from_cache => self.stats.task_completed(0),
            Ok(r) => self.stats.task_completed(r.size),
            Err(_) => self.stats.task_failed(),
        }
        result
    }

    async fn perform_inner(
        &self,
        task: &DownloadTask,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult> {
        let started = std::time::Instant::now();

        if let Some(expected) = &task.expected_hash {
            match self.cache.get(&task.url).await? {
                Some(cached) => {
                    log::debug!("cache hit for {}", task.url);
                    self.stats.cache_hit();
                    if cached != task.dest {
                        if let Some(parent) = task.dest.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        tokio::fs::copy(&cached, &task.dest).await?;
                    }
                    return Ok(DownloadResult {
                        success: true,
                        url: task.url.clone(),
                        path: task.dest.clone(),
                        size: expected.size,
                        hash: Some(expected.clone()),
                        duration: started.elapsed(),
                        from_cache: true,
                        error: None,
                    });
                }
                None => self.stats.cache_miss(),
            }
        }

        let request = FetchRequest {
            url: &task.url,
            dest: &task.dest,
            expected_hash: task.expected_hash.as_ref(),
            resume: true,
            cancel: cancel.clone(),
        };
        let outcome = self.engine.fetch(&request, sink).await?;

        if let Some(expected) = &task.expected_hash {
            // The download verified against this hash; index it so the next
            // request for the URL is a cache hit. Cache trouble is not a
            // download failure.
            if let Err(e) = self
                .cache
                .put(&task.url, &task.dest, expected.clone())
                .await
            {
                log::warn!("failed to index downloaded file in cache: {e}");
            }
        }

        Ok(DownloadResult {
            success: true,
            url: task.url.clone(),
            path: task.dest.clone(),
            size: outcome.size,
            hash: task.expected_hash.clone(),
            duration: outcome.duration,
            from_cache: false,
            error: None,
        })
    }

    /// Parallel fan-out bounded by `max_parallel_downloads`. Per-task
    /// failures are folded into the result list instead of aborting the
    /// batch; aggregate progress counts completed tasks.
    pub async fn download_files(
        &self,
        mut tasks: Vec<DownloadTask>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Vec<DownloadResult> {
        tasks.sort_by_key(|t| t.priority);
        let total = tasks.len();
        let completed = std::sync::atomic::AtomicUsize::new(0);

        stream::iter(tasks)
            .map(|task| {
                let completed = &completed;
                async move {
                    let result = match self.download_file(&task, cancel, sink).await {
                        Ok(r) => r,
                        Err(e) => DownloadResult {
                            success: false,
                            url: task.url.clone(),
                            path: task.dest.clone(),
                            size: 0,
                            hash: None,
                            duration: Duration::ZERO,
                            from_cache: false,
                            error: Some(e.to_string()),
                        },
                    };
                    let done = completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    sink.emit(
                        ProgressEvent::new(
                            Stage::Downloading,
                            done as f64 / total.max(1) as f64 * 100.0,
                            format!("{done}/{total} files"),
                        )
                        .with_file(result.url.clone()),
                    );
                    result
                }
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await
    }

    /// Verify each destination against its expected hash and download only
    /// the ones that fail.
    pub async fn download_missing(
        &self,
        files: Vec<DownloadTask>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let mut to_fetch = Vec::new();
        let total = files.len();

        for (index, task) in files.into_iter().enumerate() {
            sink.emit(
                ProgressEvent::new(
                    Stage::Verifying,
                    index as f64 / total.max(1) as f64 * 100.0,
                    format!("verifying {}/{total} files", index + 1),
                )
                .with_file(task.dest.display().to_string()),
            );
            let Some(expected) = &task.expected_hash else {
                // Nothing to verify against; always fetch.
                to_fetch.push(task);
                continue;
            };
            match hash::verify_file(&task.dest, expected).await {
                Ok(true) => report.skipped.push(task.dest.clone()),
                Ok(false) => to_fetch.push(task),
                Err(e) => {
                    log::warn!("verification failed for {}: {e}", task.dest.display());
                    to_fetch.push(task);
                }
            }
        }

        for result in self.download_files(to_fetch, cancel, sink).await {
            if result.success {
                report.downloaded.push(result.path);
            } else {
                report
                    .failed
                    .push((result.path, result.error.unwrap_or_default()));
            }
        }
        report
    }

    /// Hash-check a set of files in place.
    pub async fn verify_files(
        &self,
        pairs: &[(PathBuf, FileHash)],
    ) -> Result<HashMap<PathBuf, bool>> {
        let mut results = HashMap::with_capacity(pairs.len());
        for (path, expected) in pairs {
            let ok = hash::verify_file(path, expected).await?;
            results.insert(path.clone(), ok);
        }
        Ok(results)
    }
}

/// Extract a zip archive into a directory, restoring Unix modes and refusing
/// entries that escape the destination.
pub async fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Read;

        std::fs::create_dir_all(&dest_dir)?;
        let file = std::fs::File::open(&archive_path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                log::warn!("skipping archive entry escaping destination: {}", entry.name());
                continue;
            };
            let out_path = dest_dir.join(relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&out_path)?;
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            std::io::Write::write_all(&mut out, &buf)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
                }
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("extraction task aborted: {e}"),
        ))
    })?
}
