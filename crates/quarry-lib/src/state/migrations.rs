//! Forward-only settings migrations over raw JSON.
//!
//! Each step is a pure function from schema `k` to `k + 1`; the chain runs in
//! order until the document reaches the current version. Newer-than-known
//! versions are refused so an old launcher never rewrites a newer install's
//! state.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::state::settings::SETTINGS_VERSION;

/// Bring a raw settings document up to the current schema version.
pub fn migrate_settings(doc: &mut Value) -> Result<()> {
    let object = doc
        .as_object_mut()
        .ok_or_else(|| Error::ConfigCorrupt("settings document is not an object".into()))?;

    let mut version = object
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(1);

    if version > SETTINGS_VERSION {
        return Err(Error::ConfigCorrupt(format!(
            "settings schema {version} is newer than supported {SETTINGS_VERSION}"
        )));
    }

    while version < SETTINGS_VERSION {
        match version {
            1 => migrate_v1_to_v2(object)?,
            other => {
                return Err(Error::MigrationFailed {
                    from: other,
                    reason: "no migration step registered".into(),
                })
            }
        }
        version += 1;
        object.insert("version".into(), Value::from(version));
    }

    Ok(())
}

/// v1 stored the locale under `lang` with bare codes and had no bandwidth or
/// parallelism options.
fn migrate_v1_to_v2(object: &mut Map<String, Value>) -> Result<()> {
    if let Some(lang) = object.remove("lang") {
        let tag = match lang.as_str() {
            Some("pt") | Some("pt-BR") => "pt-BR",
            Some("es") | Some("es-ES") => "es-ES",
            _ => "en-US",
        };
        object.insert("language".into(), Value::from(tag));
    }

    object
        .entry("max_download_speed_bps")
        .or_insert(Value::Null);
    object
        .entry("max_parallel_downloads")
        .or_insert(Value::Null);

    Ok(())
}
