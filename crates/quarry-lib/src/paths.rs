use std::path::{Path, PathBuf};

/// Canonical on-disk locations derived from the application root.
///
/// Pure derivation only; the single exception is the local-override archive
/// scan, which stats a directory listing and nothing else.
#[derive(Debug, Clone)]
pub struct GamePaths {
    root: PathBuf,
}

impl GamePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-channel game directory.
    pub fn game_dir(&self, channel: &str) -> PathBuf {
        self.root
            .join("install")
            .join("release")
            .join("package")
            .join("game")
            .join(channel)
    }

    /// Java runtime directory shared by all channels.
    pub fn jre_dir(&self) -> PathBuf {
        self.root
            .join("install")
            .join("release")
            .join("package")
            .join("jre")
            .join("latest")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn cache_index_file(&self) -> PathBuf {
        self.cache_dir().join("index.json")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn user_data_dir(&self) -> PathBuf {
        self.root.join("UserData")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("user-settings.json")
    }

    pub fn versions_file(&self) -> PathBuf {
        self.root.join("gameVersion.json")
    }

    /// Conventional client executable location inside a channel's game dir.
    pub fn client_executable(&self, channel: &str) -> PathBuf {
        let name = if cfg!(windows) {
            "HytaleClient.exe"
        } else {
            "HytaleClient"
        };
        self.game_dir(channel).join("Client").join(name)
    }

    /// Conventional server archive location inside a channel's game dir.
    pub fn server_jar(&self, channel: &str) -> PathBuf {
        self.game_dir(channel).join("Server").join("HytaleServer.jar")
    }

    /// Newest `*.zip` under `<app_dir>/cdn`, by modification time. Used as the
    /// lowest-precedence local archive override source.
    pub fn newest_cdn_archive(app_dir: &Path) -> Option<PathBuf> {
        let cdn_dir = app_dir.join("cdn");
        let entries = std::fs::read_dir(&cdn_dir).ok()?;

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_zip = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            if !is_zip {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().ok()?;
            match &newest {
                Some((best, _)) if *best >= mtime => {}
                _ => newest = Some((mtime, path)),
            }
        }
        newest.map(|(_, path)| path)
    }
}
