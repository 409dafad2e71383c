// SPDX-License-Identifier: MPL-2.0

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const NAME: &str = "avif-playback";
pub const OPTIONS_FILE: &str = "options.ron";

/// Display refresh rate used to drive playback ticks when none is configured.
pub const DEFAULT_REFRESH_RATE: u32 = 60;

/// How long a decode may go without a worker response before it is failed.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration directory available on this system")]
    NoConfigDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("failed to serialize options: {0}")]
    Serialize(#[from] ron::Error),
}

/// Options recognized by the player.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(default, deny_unknown_fields)]
#[must_use]
pub struct PlayerOptions {
    /// start decoding on construction rather than on the first `play`
    pub decode_immediately: bool,
    /// use the accelerated (parallel) pixel path instead of a basic blit
    pub webgl: bool,
    /// begin playback as soon as the decoder is ready
    pub autoplay: bool,
    /// wrap playback at the end of the stream
    #[serde(rename = "loop")]
    pub looping: bool,
    /// refresh signal frequency in Hz
    pub refresh_rate: u32,
    /// worker inactivity timeout in milliseconds
    pub response_timeout_ms: u64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            decode_immediately: true,
            webgl: false,
            autoplay: false,
            looping: false,
            refresh_rate: DEFAULT_REFRESH_RATE,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }
}

impl PlayerOptions {
    /// Interval between two refresh ticks. A zero rate falls back to the default.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        let rate = if self.refresh_rate == 0 {
            DEFAULT_REFRESH_RATE
        } else {
            self.refresh_rate
        };
        Duration::from_secs_f64(1.0 / f64::from(rate))
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
#[must_use]
pub struct Config {
    pub options: PlayerOptions,
}

impl Config {
    /// Default location of the options file.
    ///
    /// # Errors
    ///
    /// Fails if the platform has no configuration directory.
    pub fn path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(NAME).join(OPTIONS_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load the options from the default location.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load options from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(why) if why.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no options file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let options = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self { options })
    }

    /// Write the options to the default location.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the file cannot be written.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    /// Write the options to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents =
            ron::ser::to_string_pretty(&self.options, ron::ser::PrettyConfig::default())?;

        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.ron")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.options.decode_immediately);
        assert!(!config.options.autoplay);
    }

    #[test]
    fn save_then_load_preserves_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(OPTIONS_FILE);

        let config = Config {
            options: PlayerOptions::default().autoplay(true).looping(true),
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn loop_field_uses_short_name() {
        let options: PlayerOptions = ron::from_str("(loop: true, webgl: true)").unwrap();
        assert!(options.looping);
        assert!(options.webgl);
        assert_eq!(options.refresh_rate, DEFAULT_REFRESH_RATE);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OPTIONS_FILE);
        fs::write(&path, "(canvas: \"main\")").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn zero_refresh_rate_falls_back() {
        let options = PlayerOptions::default().refresh_rate(0);
        assert_eq!(
            options.tick_interval(),
            Duration::from_secs_f64(1.0 / f64::from(DEFAULT_REFRESH_RATE))
        );
    }
}
