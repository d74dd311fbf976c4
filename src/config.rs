use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hotkey;
use crate::protocol::WorkerConfig;

pub const MIN_POPUP_TIMEOUT_SEC: u64 = 1;
pub const MAX_POPUP_TIMEOUT_SEC: u64 = 120;

/// Persisted user settings. The controller consumes these for defaults; the
/// settings surface writes them back through `save`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Hold-to-talk chord, e.g. "CTRL+ALT+SPACE".
    #[serde(default = "default_hotkey")]
    pub hotkey: String,

    /// Seconds the popup stays visible after a completed job. Out-of-range
    /// values are clamped to [1, 120], never rejected.
    #[serde(default = "default_popup_timeout")]
    pub popup_timeout_sec: u64,

    /// Start at login. Persisted for the surfaces that apply it; the core
    /// only stores the flag.
    #[serde(default)]
    pub auto_launch: bool,

    #[serde(default = "default_language_mode")]
    pub language_mode: String,

    /// Program plus arguments used to spawn the transcription worker.
    #[serde(default = "default_worker_cmd")]
    pub worker_cmd: Vec<String>,

    /// How long to wait for the worker's `ready` event after spawning.
    #[serde(default = "default_healthcheck_timeout")]
    pub healthcheck_timeout_sec: u64,

    /// Bounded wait for a transcript after `stop_and_transcribe` before the
    /// worker is declared hung.
    #[serde(default = "default_transcribe_timeout")]
    pub transcribe_timeout_sec: u64,
}

fn default_hotkey() -> String {
    "CTRL+ALT+SPACE".to_string()
}

fn default_popup_timeout() -> u64 {
    10
}

fn default_language_mode() -> String {
    "ru".to_string()
}

fn default_worker_cmd() -> Vec<String> {
    vec!["pushtalk-worker".to_string()]
}

fn default_healthcheck_timeout() -> u64 {
    30
}

fn default_transcribe_timeout() -> u64 {
    120
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hotkey: default_hotkey(),
            popup_timeout_sec: default_popup_timeout(),
            auto_launch: false,
            language_mode: default_language_mode(),
            worker_cmd: default_worker_cmd(),
            healthcheck_timeout_sec: default_healthcheck_timeout(),
            transcribe_timeout_sec: default_transcribe_timeout(),
        }
    }
}

impl Settings {
    /// Load settings from the default location
    /// (`~/.config/pushtalk/config.json`), creating the file with defaults on
    /// first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file not found at {:?}, creating default config", path);
            let settings = Self::default();
            settings.save_to(path)?;
            return Ok(settings);
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let settings: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(settings.clamped())
    }

    /// Save to the default location, clamping first.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let clamped = self.clone().clamped();
        let contents =
            serde_json::to_string_pretty(&clamped).context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("pushtalk").join("config.json"))
    }

    /// Apply the clamp law to every bounded field.
    pub fn clamped(mut self) -> Self {
        self.popup_timeout_sec = self
            .popup_timeout_sec
            .clamp(MIN_POPUP_TIMEOUT_SEC, MAX_POPUP_TIMEOUT_SEC);
        self
    }

    pub fn validate(&self) -> Result<()> {
        hotkey::parse_chord(&self.hotkey)?;

        if self.worker_cmd.is_empty() || self.worker_cmd[0].trim().is_empty() {
            return Err(anyhow::anyhow!("worker_cmd cannot be empty"));
        }

        Ok(())
    }

    /// The runtime options forwarded to the worker via `set_config`.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            language_mode: self.language_mode.clone(),
            popup_timeout_sec: self.popup_timeout_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.popup_timeout_sec, 10);
        assert_eq!(settings.hotkey, "CTRL+ALT+SPACE");
        assert!(!settings.auto_launch);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn clamp_law() {
        let mut settings = Settings::default();

        settings.popup_timeout_sec = 0;
        assert_eq!(settings.clone().clamped().popup_timeout_sec, 1);

        settings.popup_timeout_sec = 500;
        assert_eq!(settings.clone().clamped().popup_timeout_sec, 120);

        // In-range values survive untouched.
        for v in [1, 42, 120] {
            settings.popup_timeout_sec = v;
            assert_eq!(settings.clone().clamped().popup_timeout_sec, v);
        }
    }

    #[test]
    fn save_clamps_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut settings = Settings::default();
        settings.popup_timeout_sec = 500;
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.popup_timeout_sec, 120);

        settings.popup_timeout_sec = 42;
        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.popup_timeout_sec, 42);
    }

    #[test]
    fn first_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let settings = Settings::load_from(path.as_path()).unwrap();
        assert!(path.exists());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{\"popup_timeout_sec\": 5}").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.popup_timeout_sec, 5);
        assert_eq!(settings.hotkey, default_hotkey());
        assert_eq!(settings.worker_cmd, default_worker_cmd());
    }

    #[test]
    fn validate_rejects_bad_hotkey_and_empty_worker_cmd() {
        let mut settings = Settings::default();
        settings.hotkey = "NOT A CHORD".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.worker_cmd = vec![];
        assert!(settings.validate().is_err());
    }
}
