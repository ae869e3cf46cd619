//! Install/update lifecycle for a channel: fresh install, incremental
//! patching, rescue fallback, local-archive bootstrap and repair.

pub mod binary;
pub mod tool;

pub use binary::{BinaryPatcher, Encoding, PatchReport, ReplacementRule};
pub use tool::PatchTool;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cdn::probe::{PatchInfo, ProbeTransport, VersionProbe};
use crate::cdn::{channel_base_url, platform};
use crate::config::{ArchiveSource, LauncherConfig};
use crate::download::{extract_zip, DownloadService, DownloadTask};
use crate::error::{Error, Result};
use crate::paths::GamePaths;
use crate::progress::{CancelToken, ProgressEvent, ProgressSink, Stage};
use crate::state::StateStore;

/// Deleting a live game directory can race with file locks released by an
/// exiting process; repair retries a few times before giving up.
const REPAIR_ATTEMPTS: u32 = 3;
const REPAIR_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// CDN root above the `<os>/<arch>/<channel>` tree.
    pub cdn_base_url: String,
    /// Where the wharf tool archive is fetched from when `tools/` is empty.
    pub tool_download_url: Option<String>,
    /// Directory holding the shipped `config.json` and the `cdn/` override
    /// drop folder.
    pub app_dir: PathBuf,
    /// Upper bound for the latest-base binary search.
    pub max_search: u64,
}

/// Drives a channel from whatever is on disk to the newest CDN build.
pub struct PatchOrchestrator {
    paths: GamePaths,
    state: Arc<StateStore>,
    downloads: Arc<DownloadService>,
    launcher_config: LauncherConfig,
    tool: PatchTool,
    transport: Arc<dyn ProbeTransport>,
    config: OrchestratorConfig,
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PatchOrchestrator {
    pub fn new(
        paths: GamePaths,
        state: Arc<StateStore>,
        downloads: Arc<DownloadService>,
        launcher_config: LauncherConfig,
        transport: Arc<dyn ProbeTransport>,
        config: OrchestratorConfig,
    ) -> Self {
        let tool = PatchTool::new(paths.tools_dir(), config.tool_download_url.clone());
        Self {
            paths,
            state,
            downloads,
            launcher_config,
            tool,
            transport,
            config,
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    fn probe_for(&self, channel: &str) -> VersionProbe {
        let (os, arch) = platform();
        let base = channel_base_url(&self.config.cdn_base_url, os, arch, channel);
        VersionProbe::new(base, self.transport.clone()).with_max_search(self.config.max_search)
    }

    /// Per-channel mutual exclusion; different channels may progress
    /// concurrently.
    async fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock().await;
        locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Bring `channel` to the newest available build.
    pub async fn install_or_update(
        &self,
        channel: &str,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        sink.emit(ProgressEvent::new(
            Stage::Checking,
            -1.0,
            format!("checking installed build for {channel}"),
        ));

        let probe = self.probe_for(channel);
        let executable = self.paths.client_executable(channel);
        let record = self.state.build_record(channel).await;
        let mut current = record.build;

        // On-disk ground truth beats the recorded state: a missing
        // executable demotes the channel to "not installed".
        if current > 0 && !executable.exists() {
            log::warn!(
                "{channel} records build {current} but {} is missing; forcing fresh install",
                executable.display()
            );
            current = 0;
        }

        // Bootstrap from a local archive when nothing is on disk yet.
        if current == 0 && !executable.exists() {
            if let Some(source) = self
                .launcher_config
                .archive_source(channel, &self.config.app_dir)
            {
                self.install_local_archive(channel, source, cancel, sink)
                    .await?;
                if executable.exists() {
                    // Record whatever the CDN currently calls latest. If the
                    // archive is older than that, incremental patches land on
                    // a stale tree and the rescue path recovers.
                    sink.emit(ProgressEvent::new(
                        Stage::Syncing,
                        -1.0,
                        "synchronizing build record with CDN",
                    ));
                    if let Some(base) = probe.find_latest_base().await {
                        self.state.set_build(channel, base.to_build).await?;
                        current = base.to_build;
                        log::info!(
                            "local archive installed, assuming latest base build {current}"
                        );
                    }
                }
            }
        }

        if current == 0 {
            current = self.fresh_install(channel, &probe, cancel, sink).await?;
        }

        loop {
            match probe.find_next_patch(current).await {
                None => break,
                Some(patch) => {
                    let target = patch.to_build;
                    self.apply_or_rescue(channel, &probe, patch, cancel, sink)
                        .await?;
                    self.state.set_build(channel, target).await?;
                    current = target;
                }
            }
        }

        sink.emit(ProgressEvent::new(
            Stage::Complete,
            100.0,
            format!("{channel} is at build {current}"),
        ));
        Ok(())
    }

    /// Download and apply the newest full payload.
    async fn fresh_install(
        &self,
        channel: &str,
        probe: &VersionProbe,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        let base = probe
            .find_latest_base()
            .await
            .ok_or_else(|| Error::NoBuildAvailable(channel.to_string()))?;

        log::info!("fresh install of {channel}: full payload 0 -> {}", base.to_build);
        self.apply_patch(channel, &base, cancel, sink).await?;
        self.state.set_build(channel, base.to_build).await?;
        Ok(base.to_build)
    }

    /// Apply an incremental patch; on any failure fall back to the full
    /// payload for the same target build. The rescue itself is never
    /// rescued.
    async fn apply_or_rescue(
        &self,
        channel: &str,
        probe: &VersionProbe,
        patch: PatchInfo,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let target = patch.to_build;
        match self.apply_patch(channel, &patch, cancel, sink).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                log::warn!(
                    "incremental patch {} -> {} failed ({e}); rescuing with full payload",
                    patch.from_build,
                    target
                );
                sink.emit(ProgressEvent::new(
                    Stage::RescueMode,
                    -1.0,
                    format!("redownloading build {target}"),
                ));
                let rescue = PatchInfo {
                    from_build: 0,
                    to_build: target,
                    url: probe.patch_url(0, target),
                    is_full: true,
                };
                self.apply_patch(channel, &rescue, cancel, sink).await
            }
        }
    }

    /// Download the `.pwr` blob and hand it to the wharf tool. The blob and
    /// the staging directory are removed whatever the outcome.
    async fn apply_patch(
        &self,
        channel: &str,
        patch: &PatchInfo,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let temp = self.paths.temp_dir();
        tokio::fs::create_dir_all(&temp).await?;
        // Channel-qualified names keep concurrent channel updates from
        // treading on each other's staging state.
        let blob = temp.join(format!(
            "{channel}-{}_{}.pwr",
            patch.from_build, patch.to_build
        ));
        let staging = temp.join(format!(
            "staging-{channel}-{}-{}",
            patch.from_build, patch.to_build
        ));

        // The wharf format carries its own signature; no expected hash here.
        let task = DownloadTask::new(&patch.url, &blob);
        let game_dir = self.paths.game_dir(channel);

        let result = async {
            self.downloads.download_file(&task, cancel, sink).await?;
            tokio::fs::create_dir_all(&game_dir).await?;

            let binary = self.tool.ensure(&self.downloads, cancel, sink).await?;
            sink.emit(ProgressEvent::new(
                Stage::Patching,
                -1.0,
                format!("applying patch {} -> {}", patch.from_build, patch.to_build),
            ));
            self.tool
                .apply(&binary, &blob, &game_dir, &staging, cancel)
                .await
        }
        .await;

        let _ = tokio::fs::remove_file(&blob).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;
        result
    }

    /// Seed the game directory from a local or remote archive.
    async fn install_local_archive(
        &self,
        channel: &str,
        source: ArchiveSource,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let game_dir = self.paths.game_dir(channel);
        let temp = self.paths.temp_dir();

        let (archive, downloaded) = match source {
            ArchiveSource::Http(url) => {
                log::info!("fetching override archive for {channel} from {url}");
                tokio::fs::create_dir_all(&temp).await?;
                let dest = temp.join(format!("override-{channel}.zip"));
                let task = DownloadTask::new(&url, &dest);
                self.downloads.download_file(&task, cancel, sink).await?;
                (dest, true)
            }
            ArchiveSource::File(path) => {
                if tokio::fs::metadata(&path).await.is_err() {
                    log::warn!("configured override archive missing: {}", path.display());
                    return Ok(());
                }
                log::info!("using local override archive {}", path.display());
                (path, false)
            }
        };

        sink.emit(ProgressEvent::new(
            Stage::Extracting,
            -1.0,
            format!("extracting archive into {}", game_dir.display()),
        ));
        let result = extract_zip(&archive, &game_dir).await;
        if downloaded {
            let _ = tokio::fs::remove_file(&archive).await;
        }
        result
    }

    /// Delete the channel's game directory and forget its record. The next
    /// `install_or_update` performs a fresh install.
    pub async fn repair(&self, channel: &str) -> Result<()> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        let game_dir = self.paths.game_dir(channel);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match tokio::fs::remove_dir_all(&game_dir).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt < REPAIR_ATTEMPTS => {
                    log::warn!(
                        "repair attempt {attempt} failed for {} ({e}); retrying",
                        game_dir.display()
                    );
                    tokio::time::sleep(REPAIR_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.state.remove_record(channel).await?;
        log::info!("repaired {channel}: game directory removed, record cleared");
        Ok(())
    }
}
