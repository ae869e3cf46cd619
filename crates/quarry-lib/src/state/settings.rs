use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current settings schema version. Files reporting a newer version are
/// refused; there is no downgrade path.
pub const SETTINGS_VERSION: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Language {
    #[serde(rename = "pt-BR")]
    PtBr,
    #[default]
    #[serde(rename = "en-US")]
    EnUs,
    #[serde(rename = "es-ES")]
    EsEs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowBounds {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// User-facing launcher settings, schema v2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u64,
    pub game_dir: Option<PathBuf>,
    pub game_channel: String,
    pub use_custom_java: bool,
    pub custom_java_path: Option<PathBuf>,
    pub language: Language,
    pub window_bounds: WindowBounds,
    pub mods_enabled: bool,
    pub max_download_speed_bps: Option<u64>,
    pub max_parallel_downloads: Option<u8>,
    pub analytics_enabled: bool,
    pub auto_update_enabled: bool,
    pub hide_launcher: bool,
    pub player_uuid: Option<String>,
    pub player_name: String,
    pub setup_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            game_dir: None,
            game_channel: "latest".to_string(),
            use_custom_java: false,
            custom_java_path: None,
            language: Language::default(),
            window_bounds: WindowBounds::default(),
            mods_enabled: false,
            max_download_speed_bps: None,
            max_parallel_downloads: None,
            analytics_enabled: true,
            auto_update_enabled: true,
            hide_launcher: false,
            player_uuid: None,
            player_name: "Player".to_string(),
            setup_url: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.version != SETTINGS_VERSION {
            return Err(Error::ConfigCorrupt(format!(
                "settings version {} does not match schema {}",
                self.version, SETTINGS_VERSION
            )));
        }
        if self.window_bounds.width < 800 || self.window_bounds.height < 600 {
            return Err(Error::ConfigCorrupt(format!(
                "window bounds below minimum: {}x{}",
                self.window_bounds.width, self.window_bounds.height
            )));
        }
        if self.player_name.is_empty() || self.player_name.chars().count() > 16 {
            return Err(Error::ConfigCorrupt(format!(
                "player name must be 1-16 characters, got {:?}",
                self.player_name
            )));
        }
        if let Some(parallel) = self.max_parallel_downloads {
            if !(1..=10).contains(&parallel) {
                return Err(Error::ConfigCorrupt(format!(
                    "max_parallel_downloads must be within 1..=10, got {parallel}"
                )));
            }
        }
        if self.use_custom_java && self.custom_java_path.is_none() {
            return Err(Error::ConfigCorrupt(
                "use_custom_java set without custom_java_path".into(),
            ));
        }
        Ok(())
    }

    /// The effective bandwidth cap; 0 keeps the limiter disabled.
    pub fn download_speed_limit(&self) -> u64 {
        self.max_download_speed_bps.unwrap_or(0)
    }

    pub fn parallel_downloads(&self) -> usize {
        usize::from(self.max_parallel_downloads.unwrap_or(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_window() {
        let mut settings = Settings::default();
        settings.window_bounds = WindowBounds {
            width: 640,
            height: 480,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_long_player_name() {
        let mut settings = Settings::default();
        settings.player_name = "x".repeat(17);
        assert!(settings.validate().is_err());
        settings.player_name = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_parallelism() {
        let mut settings = Settings::default();
        settings.max_parallel_downloads = Some(11);
        assert!(settings.validate().is_err());
        settings.max_parallel_downloads = Some(0);
        assert!(settings.validate().is_err());
        settings.max_parallel_downloads = Some(10);
        settings.validate().unwrap();
    }

    #[test]
    fn custom_java_requires_path() {
        let mut settings = Settings::default();
        settings.use_custom_java = true;
        assert!(settings.validate().is_err());
        settings.custom_java_path = Some(PathBuf::from("/usr/bin/java"));
        settings.validate().unwrap();
    }

    #[test]
    fn language_round_trips_locale_tags() {
        let json = serde_json::to_string(&Language::PtBr).unwrap();
        assert_eq!(json, "\"pt-BR\"");
        let back: Language = serde_json::from_str("\"es-ES\"").unwrap();
        assert_eq!(back, Language::EsEs);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"version":2,"game_channel":"beta"}"#).unwrap();
        assert_eq!(settings.game_channel, "beta");
        assert_eq!(settings.player_name, "Player");
        settings.validate().unwrap();
    }
}
