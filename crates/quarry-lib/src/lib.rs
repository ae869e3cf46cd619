//! Content delivery and patch engine for the Quarry launcher.
//!
//! The crate composes a resumable multi-source downloader, a
//! content-addressed disk cache, a bandwidth limiter, CDN version discovery,
//! a differential-patch orchestrator with self-healing rescue, an in-place
//! binary string patcher and the durable launcher state, behind the
//! [`AppContext`] facade.

pub mod cache;
pub mod cdn;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod hash;
pub mod patch;
pub mod paths;
pub mod progress;
pub mod state;

pub use cache::{CacheConfig, CacheStore};
pub use cdn::probe::{PatchInfo, ProbeTransport, VersionProbe};
pub use config::{ArchiveSource, LauncherConfig};
pub use context::AppContext;
pub use download::{
    BandwidthLimiter, DownloadEngine, DownloadResult, DownloadService, DownloadTask, Priority,
    RetryPolicy, StatsSnapshot, SweepReport,
};
pub use error::{Error, Result};
pub use hash::FileHash;
pub use patch::{
    BinaryPatcher, Encoding, OrchestratorConfig, PatchOrchestrator, PatchReport, ReplacementRule,
};
pub use paths::GamePaths;
pub use progress::{CancelSource, CancelToken, ProgressEvent, ProgressSink, SilentSink, Stage};
pub use state::{BuildRecord, Settings, StateStore};
