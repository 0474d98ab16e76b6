// src/settings.rs
//
// Terminal settings, stored as TOML in the user's config directory.
// Every field has a serde default so older or partial files keep loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::serial::framer::DEFAULT_MAX_FRAME_LENGTH;
use crate::io::serial::session::DEFAULT_RESTART_DELAY;
use crate::io::{ConnectionConfig, Encoding, LineEnding, ReadLineEnding, SessionOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub line_ending: LineEnding,
    #[serde(default)]
    pub custom_line_ending: Option<String>,
    #[serde(default)]
    pub read_until_line_ending: bool,
    #[serde(default)]
    pub read_line_ending: ReadLineEnding,
    #[serde(default)]
    pub read_custom_line_ending: Option<String>,
    /// Encoding used for typed input
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    /// Watchdog for open/write in milliseconds. Absent = wait indefinitely.
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Directory for session log files. Absent = no file logging.
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}
fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY.as_millis() as u64
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            line_ending: LineEnding::None,
            custom_line_ending: None,
            read_until_line_ending: false,
            read_line_ending: ReadLineEnding::Lf,
            read_custom_line_ending: None,
            encoding: Encoding::Ascii,
            max_frame_length: default_max_frame_length(),
            io_timeout_ms: None,
            restart_delay_ms: default_restart_delay_ms(),
            log_dir: None,
        }
    }
}

impl TerminalSettings {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            baud_rate: self.baud_rate,
            line_ending: self.line_ending,
            custom_line_ending: self.custom_line_ending.clone(),
            read_until_line_ending: self.read_until_line_ending,
            read_line_ending: self.read_line_ending,
            read_custom_line_ending: self.read_custom_line_ending.clone(),
            max_frame_length: self.max_frame_length,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            io_timeout: self.io_timeout_ms.map(Duration::from_millis),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(PathBuf::from)
    }
}

/// `<config dir>/serialdeck/settings.toml`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let config_dir =
        dirs::config_dir().ok_or_else(|| "Failed to get config directory".to_string())?;
    Ok(config_dir.join("serialdeck").join("settings.toml"))
}

/// Load settings. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<TerminalSettings, String> {
    if !path.exists() {
        tlog!("[settings] No settings at {}, using defaults", path.display());
        return Ok(TerminalSettings::default());
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read settings: {}", e))?;

    toml::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
}

pub fn save_settings(path: &Path, settings: &TerminalSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config dir: {}", e))?;
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings, TerminalSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "baud_rate = 9600\nline_ending = \"crlf\"\nread_until_line_ending = true\nencoding = \"hex\"\n",
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.line_ending, LineEnding::Crlf);
        assert_eq!(settings.encoding, Encoding::Hex);
        assert_eq!(settings.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);

        let config = settings.connection_config();
        assert_eq!(config.send_suffix(), vec![0x0D, 0x0A]);
        assert_eq!(config.read_delimiter(), vec![0x0A]);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "baud_rate = \"fast\"").unwrap();

        let err = load_settings(&path).unwrap_err();
        assert!(err.starts_with("Failed to parse settings"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = TerminalSettings {
            io_timeout_ms: Some(2_000),
            custom_line_ending: Some(";".to_string()),
            line_ending: LineEnding::Custom,
            ..Default::default()
        };

        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(
            loaded.session_options().io_timeout,
            Some(Duration::from_millis(2_000))
        );
    }
}
