//! Durable launcher state: settings and per-channel build records.
//!
//! Both files are JSON, written atomically (`.tmp` + rename). A read-only
//! disk degrades to in-memory state with a warning instead of failing the
//! launcher.

pub mod migrations;
pub mod settings;
pub mod versions;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

pub use settings::{Language, Settings, WindowBounds, SETTINGS_VERSION};
pub use versions::BuildRecord;

pub struct StateStore {
    settings_path: PathBuf,
    versions_path: PathBuf,
    settings: RwLock<Settings>,
    versions: RwLock<HashMap<String, BuildRecord>>,
}

impl StateStore {
    /// Load state from disk. Missing files yield defaults (with a
    /// best-effort save); corrupt files fall back to defaults and log, so
    /// startup never fails on state alone. Only a settings file from a newer
    /// schema refuses to load.
    pub async fn load(settings_path: PathBuf, versions_path: PathBuf) -> Result<Self> {
        let settings = match Self::read_settings(&settings_path).await {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                let defaults = Settings::default();
                Self::write_json(&settings_path, &defaults).await.ok();
                defaults
            }
            Err(e) if is_newer_schema(&e) => return Err(e),
            Err(e) => {
                log::warn!("settings unreadable, using defaults: {e}");
                Settings::default()
            }
        };

        let versions = match Self::read_versions(&versions_path).await {
            Ok(map) => map,
            Err(e) => {
                log::warn!("version records unreadable, starting empty: {e}");
                HashMap::new()
            }
        };

        Ok(Self {
            settings_path,
            versions_path,
            settings: RwLock::new(settings),
            versions: RwLock::new(versions),
        })
    }

    async fn read_settings(path: &PathBuf) -> Result<Option<Settings>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut doc: serde_json::Value = serde_json::from_str(&data)?;
        migrations::migrate_settings(&mut doc)?;
        let settings: Settings = serde_json::from_value(doc)?;
        settings.validate()?;
        Ok(Some(settings))
    }

    async fn read_versions(path: &PathBuf) -> Result<HashMap<String, BuildRecord>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: serde_json::Value = serde_json::from_str(&data)?;
        versions::parse_versions(doc)
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Mutate settings under validation. The mutation is discarded when the
    /// result does not validate; a permission error on the write keeps the
    /// new state in memory.
    pub async fn update_settings<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.settings.write().await;
        let mut candidate = guard.clone();
        mutate(&mut candidate);
        candidate.validate()?;
        *guard = candidate.clone();
        drop(guard);

        self.persist(&self.settings_path, &candidate).await
    }

    /// The recorded build for a channel; an empty record when none exists.
    pub async fn build_record(&self, channel: &str) -> BuildRecord {
        self.versions
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_else(|| BuildRecord::empty(channel))
    }

    pub async fn all_records(&self) -> HashMap<String, BuildRecord> {
        self.versions.read().await.clone()
    }

    /// Record a successful install or patch step for a channel.
    pub async fn set_build(&self, channel: &str, build: u64) -> Result<()> {
        let snapshot = {
            let mut versions = self.versions.write().await;
            let record = versions
                .entry(channel.to_string())
                .or_insert_with(|| BuildRecord::empty(channel));
            if record.build == 0 {
                record.installed_at = Utc::now();
            } else {
                record.patched_at = Some(Utc::now());
            }
            record.build = build;
            record.channel = channel.to_string();
            versions.clone()
        };
        self.persist(&self.versions_path, &snapshot).await
    }

    /// Drop a channel's record entirely. Only the explicit repair path calls
    /// this.
    pub async fn remove_record(&self, channel: &str) -> Result<()> {
        let snapshot = {
            let mut versions = self.versions.write().await;
            versions.remove(channel);
            versions.clone()
        };
        self.persist(&self.versions_path, &snapshot).await
    }

    /// Atomic write that tolerates read-only disks: permission errors are
    /// logged and swallowed, everything else propagates.
    async fn persist<T: serde::Serialize>(&self, path: &PathBuf, value: &T) -> Result<()> {
        match Self::write_json(path, value).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_permission_denied() => {
                log::warn!(
                    "cannot persist {} (permission denied), keeping in-memory state",
                    path.display()
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn is_newer_schema(e: &Error) -> bool {
    matches!(e, Error::ConfigCorrupt(msg) if msg.contains("newer than supported"))
}
