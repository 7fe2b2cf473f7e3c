use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MediaError;

const SETTINGS_FILE_NAME: &str = "settings.json";
const OUTPUT_FOLDER_NAME: &str = "playcap";

pub const DEFAULT_FRAME_RATE: u32 = 30;
pub const DEFAULT_VIDEO_CRF: u32 = 23;
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 192;

/// Recorder configuration, constructed explicitly and passed into each
/// component rather than read from process-wide statics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Directory the final recording is written to. Falls back to a
    /// subfolder of the platform videos directory when unset or missing.
    pub output_dir: Option<PathBuf>,
    /// Base name of the final recording file (without extension). Falls
    /// back to `recording_<timestamp>` when unset or blank.
    pub file_name: Option<String>,
    /// Directory holding a bundled copy of the media tool, checked before
    /// the standard candidates and PATH.
    pub tool_dir: Option<PathBuf>,
    pub frame_rate: u32,
    pub video_crf: u32,
    pub audio_bitrate_kbps: u32,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: None,
            file_name: None,
            tool_dir: None,
            frame_rate: DEFAULT_FRAME_RATE,
            video_crf: DEFAULT_VIDEO_CRF,
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
        }
    }
}

impl RecorderSettings {
    /// Loads settings from `path`, falling back to defaults when the file
    /// is absent or unreadable. A corrupt settings file must never prevent
    /// playback or recording from working.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        "Failed to parse settings file, using defaults: {error}"
                    );
                    Self::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    "Failed to read settings file, using defaults: {error}"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), MediaError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|error| MediaError::Io(std::io::Error::other(error)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Resolves the directory the final recording should land in, creating
    /// it if needed. The configured directory wins when it is usable;
    /// otherwise a subfolder of the platform videos directory is used.
    pub fn resolve_output_dir(&self) -> Result<PathBuf, MediaError> {
        if let Some(configured) = &self.output_dir {
            if !configured.as_os_str().is_empty() {
                match fs::create_dir_all(configured) {
                    Ok(()) => return Ok(configured.clone()),
                    Err(error) => {
                        tracing::warn!(
                            output_dir = %configured.display(),
                            "Configured output directory is unusable, falling back: {error}"
                        );
                    }
                }
            }
        }

        let fallback = dirs::video_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(OUTPUT_FOLDER_NAME);
        fs::create_dir_all(&fallback)?;
        Ok(fallback)
    }

    /// Base file name for the final recording, without extension.
    pub fn output_file_stem(&self, timestamp: &str) -> String {
        match &self.file_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("recording_{timestamp}"),
        }
    }
}

/// Default on-disk location of the settings file, under the platform
/// config directory.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(OUTPUT_FOLDER_NAME).join(SETTINGS_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_path(label: &str) -> PathBuf {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("playcap_{label}_{suffix}"))
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = RecorderSettings::load(Path::new("/nonexistent/playcap/settings.json"));
        assert_eq!(settings.frame_rate, DEFAULT_FRAME_RATE);
        assert_eq!(settings.video_crf, DEFAULT_VIDEO_CRF);
        assert!(settings.output_dir.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = unique_temp_path("settings").join("settings.json");
        let mut settings = RecorderSettings::default();
        settings.file_name = Some("session".to_string());
        settings.frame_rate = 60;

        settings.save(&path).expect("save settings");
        let loaded = RecorderSettings::load(&path);
        assert_eq!(loaded.file_name.as_deref(), Some("session"));
        assert_eq!(loaded.frame_rate, 60);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = unique_temp_path("settings_corrupt");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let settings = RecorderSettings::load(&path);
        assert_eq!(settings.audio_bitrate_kbps, DEFAULT_AUDIO_BITRATE_KBPS);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn configured_output_dir_wins_when_usable() {
        let dir = unique_temp_path("output_dir");
        let mut settings = RecorderSettings::default();
        settings.output_dir = Some(dir.clone());

        let resolved = settings.resolve_output_dir().expect("resolve output dir");
        assert_eq!(resolved, dir);
        assert!(dir.is_dir());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn output_file_stem_falls_back_to_timestamped_name() {
        let settings = RecorderSettings::default();
        assert_eq!(
            settings.output_file_stem("20260825_120000"),
            "recording_20260825_120000"
        );

        let mut named = RecorderSettings::default();
        named.file_name = Some("  my take  ".to_string());
        assert_eq!(named.output_file_stem("20260825_120000"), "my take");
    }
}
