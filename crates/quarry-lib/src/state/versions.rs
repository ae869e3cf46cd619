use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The installed build for one channel. `build == 0` means no installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build: u64,
    pub channel: String,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub patched_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    pub fn empty(channel: &str) -> Self {
        Self {
            build: 0,
            channel: channel.to_string(),
            installed_at: Utc::now(),
            patched_at: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.build > 0
    }
}

/// Parse the `gameVersion.json` document.
///
/// Historic launchers wrote a single record at the top level; that legacy
/// form is accepted and lifted into the per-channel map on first read.
pub fn parse_versions(doc: Value) -> Result<HashMap<String, BuildRecord>> {
    let object = doc
        .as_object()
        .ok_or_else(|| Error::ConfigCorrupt("gameVersion.json is not an object".into()))?;

    if object.contains_key("build") {
        let record: BuildRecord = serde_json::from_value(Value::Object(object.clone()))?;
        log::info!(
            "migrating legacy single-record gameVersion.json (channel {})",
            record.channel
        );
        let mut map = HashMap::new();
        map.insert(record.channel.clone(), record);
        return Ok(map);
    }

    Ok(serde_json::from_value(doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn modern_map_form_parses() {
        let doc = json!({
            "latest": {
                "build": 7,
                "channel": "latest",
                "installed_at": "2026-01-10T12:00:00Z"
            }
        });
        let map = parse_versions(doc).unwrap();
        assert_eq!(map["latest"].build, 7);
        assert!(map["latest"].patched_at.is_none());
    }

    #[test]
    fn legacy_single_record_is_lifted() {
        let doc = json!({
            "build": 5,
            "channel": "latest",
            "installed_at": "2025-11-02T08:30:00Z",
            "patched_at": null
        });
        let map = parse_versions(doc).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["latest"].build, 5);
    }

    #[test]
    fn garbage_is_config_corrupt() {
        assert!(parse_versions(json!("nope")).is_err());
    }

    #[test]
    fn empty_record_reports_not_installed() {
        let record = BuildRecord::empty("beta");
        assert!(!record.is_installed());
        assert_eq!(record.channel, "beta");
    }
}
