use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::GamePaths;

/// One release entry in the shipped `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
}

/// The read-only configuration shipped next to the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub launcher: Option<ReleaseInfo>,
    #[serde(default)]
    pub hytale: HashMap<String, ReleaseInfo>,
}

/// Where a channel's local-archive override comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    /// Remote archive fetched over HTTP(S).
    Http(String),
    /// Archive already on disk.
    File(PathBuf),
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| Error::ConfigCorrupt(format!("{}: {e}", path.display())))
    }

    /// Like `load`, but a missing file yields the empty configuration.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| Error::ConfigCorrupt(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the archive override source for a channel.
    ///
    /// Precedence: explicit HTTP(S) URL, then explicit file path (absolute,
    /// `file://`, or relative to the config file's directory), then the
    /// newest zip under `<app_dir>/cdn`.
    pub fn archive_source(&self, channel: &str, app_dir: &Path) -> Option<ArchiveSource> {
        if let Some(entry) = self.hytale.get(channel) {
            if let Some(url) = entry.url.as_deref().filter(|u| !u.is_empty()) {
                if url.starts_with("http://") || url.starts_with("https://") {
                    return Some(ArchiveSource::Http(url.to_string()));
                }
                let path = if let Some(stripped) = url.strip_prefix("file://") {
                    PathBuf::from(stripped)
                } else {
                    let raw = PathBuf::from(url);
                    if raw.is_absolute() {
                        raw
                    } else {
                        app_dir.join(raw)
                    }
                };
                return Some(ArchiveSource::File(path));
            }
        }

        GamePaths::newest_cdn_archive(app_dir).map(ArchiveSource::File)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config_with_url(url: &str) -> LauncherConfig {
        let mut hytale = HashMap::new();
        hytale.insert(
            "latest".to_string(),
            ReleaseInfo {
                version: "1.0.0".into(),
                url: Some(url.into()),
                notes: None,
                mandatory: false,
            },
        );
        LauncherConfig {
            launcher: None,
            hytale,
        }
    }

    #[test]
    fn http_url_wins() {
        let tmp = tempdir().unwrap();
        let cdn = tmp.path().join("cdn");
        fs::create_dir_all(&cdn).unwrap();
        fs::write(cdn.join("fallback.zip"), b"z").unwrap();

        let config = config_with_url("https://cdn.example/latest.zip");
        assert_eq!(
            config.archive_source("latest", tmp.path()),
            Some(ArchiveSource::Http("https://cdn.example/latest.zip".into()))
        );
    }

    #[test]
    fn file_url_resolves_to_path() {
        let tmp = tempdir().unwrap();
        let config = config_with_url("file:///srv/builds/latest.zip");
        assert_eq!(
            config.archive_source("latest", tmp.path()),
            Some(ArchiveSource::File(PathBuf::from("/srv/builds/latest.zip")))
        );
    }

    #[test]
    fn relative_path_is_anchored_at_app_dir() {
        let tmp = tempdir().unwrap();
        let config = config_with_url("builds/latest.zip");
        assert_eq!(
            config.archive_source("latest", tmp.path()),
            Some(ArchiveSource::File(tmp.path().join("builds/latest.zip")))
        );
    }

    #[test]
    fn falls_back_to_newest_cdn_zip() {
        let tmp = tempdir().unwrap();
        let cdn = tmp.path().join("cdn");
        fs::create_dir_all(&cdn).unwrap();
        fs::write(cdn.join("drop.zip"), b"z").unwrap();

        let config = LauncherConfig::default();
        assert_eq!(
            config.archive_source("latest", tmp.path()),
            Some(ArchiveSource::File(cdn.join("drop.zip")))
        );
    }

    #[test]
    fn no_sources_is_none() {
        let tmp = tempdir().unwrap();
        let config = LauncherConfig::default();
        assert_eq!(config.archive_source("latest", tmp.path()), None);
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let tmp = tempdir().unwrap();
        let config = LauncherConfig::load_or_default(&tmp.path().join("config.json")).unwrap();
        assert!(config.hytale.is_empty());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, b"{not json").unwrap();
        let err = LauncherConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), "config_corrupt");
    }
}
