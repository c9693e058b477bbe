use remembr_core::recognizer::{DEFAULT_ENDPOINT, DEFAULT_MODEL};
use remembr_core::{GeminiConfig, ImageSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::monitor::Timing;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "no API key configured: set REMEMBR_API_KEY (or GEMINI_API_KEY), \
         or api_key in the config file"
    )]
    MissingApiKey,
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// On-disk configuration. Every key is optional; environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub camera_device: Option<String>,
    pub warmup_frames: Option<usize>,
    pub store_path: Option<PathBuf>,
    pub startup_delay_ms: Option<u64>,
    pub standard_interval_ms: Option<u64>,
    pub backoff_interval_ms: Option<u64>,
    pub recognition_timeout_ms: Option<u64>,
    pub validation_timeout_ms: Option<u64>,
    pub max_image_width: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub speech_command: Option<String>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Option<Self>, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&text).map(Some).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Daemon configuration, resolved from the config file and `REMEMBR_*` variables.
pub struct Config {
    /// Recognition service API key. Never logged.
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Frames discarded after opening the camera.
    pub warmup_frames: usize,
    /// Flat JSON file holding the visitor list.
    pub store_path: PathBuf,
    pub startup_delay: Duration,
    pub standard_interval: Duration,
    /// Delay used after the service reports rate limiting.
    pub backoff_interval: Duration,
    pub recognition_timeout: Duration,
    pub validation_timeout: Duration,
    pub image: ImageSettings,
    /// Text-to-speech program; announcements are only logged when unset.
    pub speech_command: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("camera_device", &self.camera_device)
            .field("store_path", &self.store_path)
            .field("standard_interval", &self.standard_interval)
            .field("backoff_interval", &self.backoff_interval)
            .field("recognition_timeout", &self.recognition_timeout)
            .field("speech_command", &self.speech_command)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load the config file (`REMEMBR_CONFIG` or the XDG default) and apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("REMEMBR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"));
        let file = FileConfig::read(&path)?;
        if file.is_some() {
            tracing::info!(path = %path.display(), "config file loaded");
        }
        Self::resolve(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Merge file values with variables from `env`, then validate.
    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let api_key = env("REMEMBR_API_KEY")
            .or_else(|| env("GEMINI_API_KEY"))
            .or(file.api_key)
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let ms = |key: &'static str, file_value: Option<u64>, default: u64| {
            parse_env(&env, key)
                .map(|v| Duration::from_millis(v.or(file_value).unwrap_or(default)))
        };

        let defaults = ImageSettings::default();
        let config = Self {
            api_key,
            model: env("REMEMBR_MODEL")
                .or(file.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            endpoint: env("REMEMBR_ENDPOINT")
                .or(file.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            camera_device: env("REMEMBR_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            warmup_frames: parse_env(&env, "REMEMBR_WARMUP_FRAMES")?
                .or(file.warmup_frames)
                .unwrap_or(4),
            store_path: env("REMEMBR_STORE_PATH")
                .map(PathBuf::from)
                .or(file.store_path)
                .unwrap_or_else(|| data_dir().join("visitors.json")),
            startup_delay: ms("REMEMBR_STARTUP_DELAY_MS", file.startup_delay_ms, 1_000)?,
            standard_interval: ms("REMEMBR_STANDARD_INTERVAL_MS", file.standard_interval_ms, 3_000)?,
            backoff_interval: ms("REMEMBR_BACKOFF_INTERVAL_MS", file.backoff_interval_ms, 10_000)?,
            recognition_timeout: ms(
                "REMEMBR_RECOGNITION_TIMEOUT_MS",
                file.recognition_timeout_ms,
                8_000,
            )?,
            validation_timeout: ms(
                "REMEMBR_VALIDATION_TIMEOUT_MS",
                file.validation_timeout_ms,
                10_000,
            )?,
            image: ImageSettings {
                max_width: parse_env(&env, "REMEMBR_MAX_IMAGE_WIDTH")?
                    .or(file.max_image_width)
                    .unwrap_or(defaults.max_width),
                jpeg_quality: parse_env(&env, "REMEMBR_JPEG_QUALITY")?
                    .or(file.jpeg_quality)
                    .unwrap_or(defaults.jpeg_quality),
            },
            speech_command: env("REMEMBR_SPEECH_COMMAND").or(file.speech_command),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("standard_interval", self.standard_interval.is_zero()),
            ("backoff_interval", self.backoff_interval.is_zero()),
            ("recognition_timeout", self.recognition_timeout.is_zero()),
            ("validation_timeout", self.validation_timeout.is_zero()),
            ("max_image_width", self.image.max_width == 0),
        ];
        match checks.into_iter().find(|(_, bad)| *bad) {
            Some((key, _)) => Err(ConfigError::ZeroInterval(key)),
            None => Ok(()),
        }
    }

    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            image: self.image,
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            startup_delay: self.startup_delay,
            standard_interval: self.standard_interval,
            backoff_interval: self.backoff_interval,
            recognition_timeout: self.recognition_timeout,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("remembr")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("remembr")
}
