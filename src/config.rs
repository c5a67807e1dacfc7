// ⚙️ Settings - Operator-tunable limits
// Owned by the operator, consumed by the core as plain values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Row cap per table (None = unlimited)
    pub max_rows: Option<usize>,

    /// Window size for bounded reads (None = single read)
    pub chunk_size: Option<usize>,

    /// Runs older than this are removed at start-up (None = keep forever)
    pub ttl_days: Option<u32>,

    /// Enables the remote text-assist provider
    #[serde(default)]
    pub use_remote_assist: bool,
}

/// Row limits handed to the table loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadLimits {
    pub max_rows: Option<usize>,
    pub window_size: Option<usize>,
}

impl LoadLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = (max_rows > 0).then_some(max_rows);
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = (window_size > 0).then_some(window_size);
        self
    }
}

impl Settings {
    /// Load settings, falling back to defaults for anything unreadable.
    ///
    /// A missing file, malformed JSON or a non-object payload all yield
    /// defaults. Integers that are absent, not integers, or <= 0 become None.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let content = match fs::read_to_string(path.as_ref()) {
            Ok(content) => content,
            Err(_) => return Settings::default(),
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(payload)) => Settings {
                max_rows: positive_int(payload.get("max_rows")).map(|v| v as usize),
                chunk_size: positive_int(payload.get("chunk_size")).map(|v| v as usize),
                ttl_days: positive_int(payload.get("ttl_days"))
                    .and_then(|v| u32::try_from(v).ok()),
                use_remote_assist: matches!(payload.get("use_remote_assist"), Some(Value::Bool(true))),
            },
            Ok(_) => Settings::default(),
            Err(err) => {
                tracing::warn!("ignoring malformed settings file {:?}: {}", path.as_ref(), err);
                Settings::default()
            }
        }
    }

    pub fn load_limits(&self) -> LoadLimits {
        LoadLimits {
            max_rows: self.max_rows,
            window_size: self.chunk_size,
        }
    }
}

/// Accepts JSON integers and integer-looking strings, like a lenient form field.
fn positive_int(value: Option<&Value>) -> Option<u64> {
    let parsed = match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    u64::try_from(parsed).ok().filter(|v| *v > 0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_invalid_values_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"max_rows": 0, "chunk_size": "500", "ttl_days": -3, "use_remote_assist": "yes"}"#,
        )
        .unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.max_rows, None);
        assert_eq!(settings.chunk_size, Some(500));
        assert_eq!(settings.ttl_days, None);
        assert!(!settings.use_remote_assist);
    }

    #[test]
    fn test_non_object_payload_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());

        fs::write(&path, "{not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn test_full_settings_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"max_rows": 1000, "chunk_size": 100, "ttl_days": 7, "use_remote_assist": true}"#,
        )
        .unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(
            loaded,
            Settings {
                max_rows: Some(1000),
                chunk_size: Some(100),
                ttl_days: Some(7),
                use_remote_assist: true,
            }
        );
        assert_eq!(
            loaded.load_limits(),
            LoadLimits::unlimited().with_max_rows(1000).with_window_size(100)
        );
    }
}
