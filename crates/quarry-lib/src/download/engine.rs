use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::download::bandwidth::BandwidthLimiter;
use crate::download::retry::{self, RetryPolicy};
use crate::error::{Error, Result};
use crate::hash::{self, Algorithms, FileHash};
use crate::progress::{CancelToken, ProgressEvent, ProgressSink, Stage};

/// Progress is emitted at most this often (~10 Hz).
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// A single-URL resumable fetch.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected_hash: Option<&'a FileHash>,
    pub resume: bool,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub size: u64,
    pub duration: Duration,
    pub resumed: bool,
}

/// Resumable HTTP GET engine. Writes through a `.part` staging file, renames
/// into place only after the stream ends cleanly, and gates every chunk
/// through the bandwidth limiter.
pub struct DownloadEngine {
    client: Client,
    limiter: Arc<BandwidthLimiter>,
    retry_policy: RetryPolicy,
}

impl DownloadEngine {
    pub fn new(limiter: Arc<BandwidthLimiter>, retry_policy: RetryPolicy) -> Result<Self> {
        // Keep-alive with an unbounded idle pool; bind IPv4 so dual-stack
        // hosts with broken v6 routes don't stall the launcher.
        let client = Client::builder()
            .tcp_nodelay(true)
            .local_address(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            limiter,
            retry_policy,
        })
    }

    pub fn limiter(&self) -> &Arc<BandwidthLimiter> {
        &self.limiter
    }

    /// Fetch `url` into `dest`. The whole attempt, including resume
    /// detection, sits under the retry harness; hash mismatches are surfaced
    /// without retrying.
    pub async fn fetch(
        &self,
        req: &FetchRequest<'_>,
        sink: &dyn ProgressSink,
    ) -> Result<FetchOutcome> {
        if let Some(parent) = req.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let start = Instant::now();
        let (size, resumed) = retry::retry(&self.retry_policy, |_| self.attempt(req, sink)).await?;

        if let Some(expected) = req.expected_hash {
            self.verify(req.dest, expected).await?;
        }

        let duration = start.elapsed();
        let secs = duration.as_secs_f64();
        log::info!(
            "download complete: url={}, size={} bytes, time={:.2}s, throughput={:.2} MB/s{}",
            req.url,
            size,
            secs,
            (size as f64 / 1024.0 / 1024.0) / secs.max(0.001),
            if resumed { " (resumed)" } else { "" }
        );

        Ok(FetchOutcome {
            size,
            duration,
            resumed,
        })
    }

    async fn attempt(
        &self,
        req: &FetchRequest<'_>,
        sink: &dyn ProgressSink,
    ) -> Result<(u64, bool)> {
        let part = part_path(req.dest);
        let mut allow_resume = req.resume;

        loop {
            let mut offset = 0u64;
            if allow_resume {
                if let Ok(meta) = tokio::fs::metadata(&part).await {
                    offset = meta.len();
                }
            } else if tokio::fs::metadata(&part).await.is_ok() {
                tokio::fs::remove_file(&part).await?;
            }

            let mut request = self.client.get(req.url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                // The partial no longer lines up with the origin; start over.
                log::debug!("416 for {}, discarding partial and restarting", req.url);
                let _ = tokio::fs::remove_file(&part).await;
                allow_resume = false;
                continue;
            }
            if !status.is_success() {
                return Err(Error::HttpStatus {
                    status: status.as_u16(),
                    url: req.url.to_string(),
                });
            }
            if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
                // Origin ignored the range; restart from scratch.
                log::debug!("range ignored by {}, restarting full download", req.url);
                let _ = tokio::fs::remove_file(&part).await;
                allow_resume = false;
                continue;
            }

            let content_length = response.content_length();
            let total = content_length.map(|len| offset + len);
            let resumed = offset > 0;

            let mut file = if resumed {
                OpenOptions::new().append(true).open(&part).await?
            } else {
                File::create(&part).await?
            };

            let received =
                match self
                    .pump(response, &mut file, offset, total, req, sink)
                    .await
                {
                    Ok(n) => n,
                    Err(e) => {
                        file.flush().await.ok();
                        drop(file);
                        if e.is_cancelled() && req.cancel.is_destructive() {
                            let _ = tokio::fs::remove_file(&part).await;
                        }
                        return Err(e);
                    }
                };

            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            if let Some(expected) = content_length {
                if received < expected {
                    // Keep the partial; the retry wrapper will resume it.
                    return Err(Error::IncompleteDownload {
                        received: offset + received,
                        expected: offset + expected,
                    });
                }
            }

            tokio::fs::rename(&part, req.dest).await?;
            return Ok((offset + received, resumed));
        }
    }

    async fn pump(
        &self,
        response: reqwest::Response,
        file: &mut File,
        offset: u64,
        total: Option<u64>,
        req: &FetchRequest<'_>,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        let started = Instant::now();
        let mut last_emit = Instant::now()
            .checked_sub(PROGRESS_INTERVAL)
            .unwrap_or_else(Instant::now);

        while let Some(chunk) = stream.next().await {
            if req.cancel.is_cancelled() {
                log::debug!("download cancelled: {}", req.url);
                return Err(Error::Cancelled);
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                // A body cut short of the advertised length is an incomplete
                // download, which the retry wrapper resumes; anything else is
                // a transport fault.
                Err(e) => match total {
                    Some(expected) if offset + received < expected => {
                        log::debug!("stream for {} dropped mid-body: {e}", req.url);
                        return Err(Error::IncompleteDownload {
                            received: offset + received,
                            expected,
                        });
                    }
                    _ => return Err(e.into()),
                },
            };
            self.limiter.acquire(chunk.len()).await;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                last_emit = Instant::now();
                let downloaded = offset + received;
                let elapsed = started.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    (received as f64 / elapsed) as u64
                } else {
                    0
                };
                let percent = total
                    .filter(|t| *t > 0)
                    .map(|t| downloaded as f64 / t as f64 * 100.0)
                    .unwrap_or(-1.0);
                let eta = total.and_then(|t| {
                    (speed > 0).then(|| t.saturating_sub(downloaded) / speed.max(1))
                });
                sink.emit(
                    ProgressEvent::new(Stage::Downloading, percent, req.url)
                        .with_file(req.dest.display().to_string())
                        .with_rate(speed, eta),
                );
            }
        }

        Ok(received)
    }

    async fn verify(&self, path: &Path, expected: &FileHash) -> Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        let actual = hash::hash_file(path, Algorithms::ALL).await?;

        let ok = meta.len() == expected.size
            && actual.sha256.eq_ignore_ascii_case(&expected.sha256)
            && (expected.md5.is_empty() || actual.md5.eq_ignore_ascii_case(&expected.md5))
            && (expected.sha1.is_empty() || actual.sha1.eq_ignore_ascii_case(&expected.sha1));

        if !ok {
            log::warn!(
                "hash mismatch after download: {} (expected {}, got {})",
                path.display(),
                expected.sha256,
                actual.sha256
            );
            let _ = tokio::fs::remove_file(path).await;
            return Err(Error::HashMismatch {
                path: path.to_path_buf(),
                expected: expected.sha256.clone(),
                actual: actual.sha256,
            });
        }
        Ok(())
    }
}

/// Staging path used while a download is in flight.
pub fn part_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{name}.part"))
}
