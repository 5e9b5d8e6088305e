// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use duration_string::DurationString;
use serde::Deserialize;

use super::audio::Audio;
use super::error::ConfigError;
use crate::transport::Timing;

const DEFAULT_SOUNDS_DIR: &str = "sounds";
const DEFAULT_SETTINGS_FILE: &str = "beatpad-settings.json";
const DEFAULT_RECORDINGS_DIR: &str = "recordings";
const DEFAULT_MAX_POLYPHONY: usize = 8;
const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECORDING: Duration = Duration::from_secs(300);

/// Scheduler timing overrides.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Scheduler {
    /// How often the scheduler polls (default: 25ms).
    interval: Option<String>,
    /// How far ahead of the audio clock steps are scheduled (default: 100ms).
    lookahead: Option<String>,
    /// Delay between start and the first step (default: 50ms).
    start_delay: Option<String>,
}

/// The engine configuration, read from YAML with `BEATPAD__*` environment overrides.
///
/// Relative paths are resolved against the directory holding the configuration file.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct EngineConfig {
    /// The audio output.
    #[serde(default)]
    audio: Audio,
    /// Directory sound locators resolve against.
    sounds_dir: Option<String>,
    /// Optional catalog YAML. The built-in catalog is used when unset.
    catalog: Option<String>,
    /// Where user settings are persisted.
    settings: Option<String>,
    /// Where recordings are downloaded to.
    recordings_dir: Option<String>,
    /// Maximum concurrently registered voices (default: 8).
    max_polyphony: Option<usize>,
    /// Grace period before sound loading is force-finalized (default: 5s).
    load_timeout: Option<String>,
    /// Recording window (default: 300s).
    max_recording: Option<String>,
    #[serde(default)]
    scheduler: Scheduler,

    #[serde(skip)]
    base_dir: PathBuf,
}

fn parse_duration(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())
            .map_err(|e| ConfigError::InvalidDuration {
                field,
                message: e.to_string(),
            })?
            .into()),
        None => Ok(default),
    }
}

impl EngineConfig {
    /// Creates a configuration with every default and the given audio device.
    pub fn new(audio: Audio) -> EngineConfig {
        EngineConfig {
            audio,
            ..Default::default()
        }
    }

    /// Resolves relative paths against `dir`.
    pub fn with_base_dir(mut self, dir: &Path) -> EngineConfig {
        self.base_dir = dir.to_path_buf();
        self
    }

    /// Parses the configuration from a YAML file. Durations are validated here.
    pub fn deserialize(path: &Path) -> Result<EngineConfig, ConfigError> {
        let mut config: EngineConfig = Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("BEATPAD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.timing()?;
        config.load_timeout()?;
        config.max_recording()?;
        Ok(config)
    }

    fn resolve(&self, value: &Option<String>, default: &str) -> PathBuf {
        self.base_dir
            .join(value.as_deref().unwrap_or(default))
    }

    pub fn audio(&self) -> &Audio {
        &self.audio
    }

    pub fn sounds_dir(&self) -> PathBuf {
        self.resolve(&self.sounds_dir, DEFAULT_SOUNDS_DIR)
    }

    pub fn catalog(&self) -> Option<PathBuf> {
        self.catalog.as_ref().map(|catalog| self.base_dir.join(catalog))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.resolve(&self.settings, DEFAULT_SETTINGS_FILE)
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.resolve(&self.recordings_dir, DEFAULT_RECORDINGS_DIR)
    }

    pub fn max_polyphony(&self) -> usize {
        self.max_polyphony.unwrap_or(DEFAULT_MAX_POLYPHONY).max(1)
    }

    pub fn load_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("load_timeout", &self.load_timeout, DEFAULT_LOAD_TIMEOUT)
    }

    pub fn max_recording(&self) -> Result<Duration, ConfigError> {
        parse_duration("max_recording", &self.max_recording, DEFAULT_MAX_RECORDING)
    }

    /// Scheduler timing with defaults filled in.
    pub fn timing(&self) -> Result<Timing, ConfigError> {
        let defaults = Timing::default();
        Ok(Timing {
            interval: parse_duration(
                "scheduler.interval",
                &self.scheduler.interval,
                defaults.interval,
            )?,
            lookahead: parse_duration(
                "scheduler.lookahead",
                &self.scheduler.lookahead,
                defaults.lookahead,
            )?,
            start_delay: parse_duration(
                "scheduler.start_delay",
                &self.scheduler.start_delay,
                defaults.start_delay,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_config(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("beatpad.yaml");
        fs::write(&path, yaml).expect("write config");
        (dir, path)
    }

    #[test]
    fn test_defaults() {
        let (dir, path) = write_config("audio:\n  device: mock-output\n");
        let config = EngineConfig::deserialize(&path).expect("config");
        assert_eq!(config.audio().device(), "mock-output");
        assert_eq!(config.sounds_dir(), dir.path().join("sounds"));
        assert_eq!(config.catalog(), None);
        assert_eq!(
            config.settings_path(),
            dir.path().join("beatpad-settings.json")
        );
        assert_eq!(config.max_polyphony(), 8);
        assert_eq!(config.load_timeout().expect("duration"), Duration::from_secs(5));
        assert_eq!(
            config.max_recording().expect("duration"),
            Duration::from_secs(300)
        );
        assert_eq!(config.timing().expect("timing"), Timing::default());
    }

    #[test]
    fn test_overrides() {
        let (dir, path) = write_config(
            r#"
audio:
  device: mock-output
  sample_rate: 44100
sounds_dir: /opt/sounds
catalog: catalog.yaml
max_polyphony: 4
load_timeout: 2s
max_recording: 1m
scheduler:
  interval: 10ms
  lookahead: 200ms
"#,
        );
        let config = EngineConfig::deserialize(&path).expect("config");
        assert_eq!(config.audio().sample_rate(), 44100);
        assert_eq!(config.sounds_dir(), PathBuf::from("/opt/sounds"));
        assert_eq!(config.catalog(), Some(dir.path().join("catalog.yaml")));
        assert_eq!(config.max_polyphony(), 4);
        assert_eq!(config.load_timeout().expect("duration"), Duration::from_secs(2));
        assert_eq!(
            config.max_recording().expect("duration"),
            Duration::from_secs(60)
        );
        let timing = config.timing().expect("timing");
        assert_eq!(timing.interval, Duration::from_millis(10));
        assert_eq!(timing.lookahead, Duration::from_millis(200));
        assert_eq!(timing.start_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_duration() {
        let (_dir, path) = write_config("audio:\n  device: mock\nload_timeout: soon\n");
        assert!(matches!(
            EngineConfig::deserialize(&path),
            Err(ConfigError::InvalidDuration {
                field: "load_timeout",
                ..
            })
        ));
    }
}
