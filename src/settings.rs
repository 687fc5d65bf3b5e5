use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{CacheKind, OutputKind};

/// Returns the path to the settings file: `~/.config/cue-audio/settings.json`
fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("cue-audio");
    path.push("settings.json");
    path
}

/// Persisted playback settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    // Cache
    pub cache_kind: CacheKind,
    /// Directory for disk cache files; the system temp dir when unset
    pub cache_dir: Option<PathBuf>,
    pub cache_name_pattern: String,

    // Output
    pub output: OutputKind,
    pub volume: f32,

    // Timing
    pub player_poll_ms: u64,
    pub position_poll_ms: u64,
    /// Grace period past the range end before a range playback is cut off
    pub stop_slack_ms: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            cache_kind: CacheKind::default(),
            cache_dir: None,
            cache_name_pattern: "audio%02i.tmp".to_string(),

            output: OutputKind::default(),
            volume: 1.0,

            player_poll_ms: 100,
            position_poll_ms: 20,
            stop_slack_ms: 200,
        }
    }
}

impl PlaybackSettings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(&settings_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) {
        self.save_to(&settings_path());
    }

    pub fn save_to(&self, path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!("Failed to write settings: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Failed to serialize settings: {}", e);
            }
        }
    }

    /// Directory disk caches are created in
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn player_poll_interval(&self) -> Duration {
        Duration::from_millis(self.player_poll_ms)
    }

    pub fn position_poll_interval(&self) -> Duration {
        Duration::from_millis(self.position_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PlaybackSettings::default();
        assert_eq!(settings.cache_kind, CacheKind::Disk);
        assert_eq!(settings.output, OutputKind::Cpal);
        assert_eq!(settings.player_poll_interval(), Duration::from_millis(100));
        assert_eq!(settings.position_poll_interval(), Duration::from_millis(20));
        assert_eq!(settings.cache_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings: PlaybackSettings =
            serde_json::from_str(r#"{ "cache_kind": "Ram", "volume": 0.5 }"#).unwrap();
        assert_eq!(settings.cache_kind, CacheKind::Ram);
        assert_eq!(settings.volume, 0.5);
        assert_eq!(settings.stop_slack_ms, 200);
        assert_eq!(settings.cache_name_pattern, "audio%02i.tmp");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = PlaybackSettings {
            cache_kind: CacheKind::None,
            cache_dir: Some(dir.path().to_path_buf()),
            output: OutputKind::Null,
            ..Default::default()
        };

        settings.save_to(&path);

        assert_eq!(PlaybackSettings::load_from(&path), settings);
    }

    #[test]
    fn test_unreadable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        assert_eq!(PlaybackSettings::load_from(&path), PlaybackSettings::default());
        assert_eq!(
            PlaybackSettings::load_from(&dir.path().join("missing.json")),
            PlaybackSettings::default()
        );
    }
}
