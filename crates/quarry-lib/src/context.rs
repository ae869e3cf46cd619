//! Application context: owns the state store, download service and patch
//! orchestrator, and exposes the engine API consumed by the launcher shell.
//!
//! Ownership is one-way: the service owns the engine which owns the limiter,
//! the orchestrator holds the service and the store, and nothing points back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheConfig, CacheStore};
use crate::cdn::probe::ProbeTransport;
use crate::cdn::HttpProbeTransport;
use crate::config::LauncherConfig;
use crate::download::{
    BandwidthLimiter, DownloadEngine, DownloadResult, DownloadService, DownloadTask, RetryPolicy,
    StatsSnapshot, SweepReport,
};
use crate::error::Result;
use crate::hash::FileHash;
use crate::patch::{
    BinaryPatcher, Encoding, OrchestratorConfig, PatchOrchestrator, PatchReport, ReplacementRule,
};
use crate::paths::GamePaths;
use crate::progress::{CancelToken, ProgressSink, SilentSink};
use crate::state::{Settings, StateStore};

/// Default CDN root above the `<os>/<arch>/<channel>` tree.
pub const DEFAULT_CDN_BASE_URL: &str = "https://game-cdn.sanasol.ws/hytale";

/// Where the wharf tool ships from, per platform.
fn default_tool_url() -> String {
    let os = if cfg!(windows) {
        "windows-amd64"
    } else if cfg!(target_os = "macos") {
        "darwin-amd64"
    } else {
        "linux-amd64"
    };
    format!("https://broth.itch.zone/butler/{os}/LATEST/archive/default")
}

/// Everything the launcher shell needs from the content engine.
pub struct AppContext {
    paths: GamePaths,
    state: Arc<StateStore>,
    downloads: Arc<DownloadService>,
    orchestrator: PatchOrchestrator,
}

impl AppContext {
    /// Wire up the engine under `root` with the shipped configuration in
    /// `app_dir`. Runs the cache integrity self-check before returning.
    pub async fn new(root: PathBuf, app_dir: PathBuf) -> Result<Self> {
        let transport: Arc<dyn ProbeTransport> = Arc::new(HttpProbeTransport::new()?);
        Self::with_transport(root, app_dir, transport, None).await
    }

    /// Like [`AppContext::new`] with an injectable probe transport and CDN
    /// root, for hosts that stage their own CDN.
    pub async fn with_transport(
        root: PathBuf,
        app_dir: PathBuf,
        transport: Arc<dyn ProbeTransport>,
        cdn_base_url: Option<String>,
    ) -> Result<Self> {
        let paths = GamePaths::new(root);
        let state = Arc::new(
            StateStore::load(paths.settings_file(), paths.versions_file()).await?,
        );
        let settings = state.settings().await;

        let limiter = Arc::new(BandwidthLimiter::new(settings.download_speed_limit()));
        let engine = DownloadEngine::new(limiter, RetryPolicy::default())?;
        let cache = Arc::new(CacheStore::open(paths.cache_dir(), CacheConfig::default()).await?);
        let downloads = Arc::new(DownloadService::new(
            engine,
            cache,
            settings.parallel_downloads(),
        ));
        downloads.start().await?;

        let launcher_config = LauncherConfig::load_or_default(&app_dir.join("config.json"))?;
        let cdn_base_url = cdn_base_url
            .or_else(|| settings.setup_url.clone())
            .unwrap_or_else(|| DEFAULT_CDN_BASE_URL.to_string());

        let orchestrator = PatchOrchestrator::new(
            paths.clone(),
            state.clone(),
            downloads.clone(),
            launcher_config,
            transport,
            OrchestratorConfig {
                cdn_base_url,
                tool_download_url: Some(default_tool_url()),
                app_dir,
                max_search: crate::cdn::probe::DEFAULT_MAX_SEARCH,
            },
        );

        Ok(Self {
            paths,
            state,
            downloads,
            orchestrator,
        })
    }

    pub fn paths(&self) -> &GamePaths {
        &self.paths
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn downloads(&self) -> &Arc<DownloadService> {
        &self.downloads
    }

    pub async fn settings(&self) -> Settings {
        self.state.settings().await
    }

    /// Update settings and push the live-tunable knobs into the running
    /// services.
    pub async fn update_settings<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        self.state.update_settings(mutate).await?;
        let settings = self.state.settings().await;
        self.downloads
            .limiter()
            .set_limit(settings.download_speed_limit());
        Ok(())
    }

    pub async fn download_file(&self, task: &DownloadTask) -> Result<DownloadResult> {
        self.downloads
            .download_file(task, &CancelToken::none(), &SilentSink)
            .await
    }

    pub async fn download_files(
        &self,
        tasks: Vec<DownloadTask>,
        sink: &dyn ProgressSink,
    ) -> Vec<DownloadResult> {
        self.downloads
            .download_files(tasks, &CancelToken::none(), sink)
            .await
    }

    pub async fn download_missing(
        &self,
        files: Vec<DownloadTask>,
        sink: &dyn ProgressSink,
    ) -> SweepReport {
        self.downloads
            .download_missing(files, &CancelToken::none(), sink)
            .await
    }

    pub async fn install_or_update(&self, channel: &str, sink: &dyn ProgressSink) -> Result<()> {
        self.orchestrator
            .install_or_update(channel, &CancelToken::none(), sink)
            .await
    }

    pub async fn install_or_update_with_cancel(
        &self,
        channel: &str,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        self.orchestrator.install_or_update(channel, cancel, sink).await
    }

    pub async fn repair(&self, channel: &str) -> Result<()> {
        self.orchestrator.repair(channel).await
    }

    pub async fn patch_binary(
        &self,
        path: &Path,
        rules: &[ReplacementRule],
        encoding: Encoding,
    ) -> Result<PatchReport> {
        BinaryPatcher::patch(path, rules, encoding).await
    }

    pub async fn verify_files(
        &self,
        pairs: &[(PathBuf, FileHash)],
    ) -> Result<HashMap<PathBuf, bool>> {
        self.downloads.verify_files(pairs).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.downloads.stats()
    }
}
