//! Host configuration loading from file and environment variables.

use parley_types::StreamType;
use parley_voice::{TtsEngineKind, VoiceConfig};
use serde::Deserialize;
use thiserror::Error;

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Voice helper settings.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Loopback smoke run.
    #[serde(default)]
    pub smoke: SmokeConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmokeConfig {
    /// File or URL to play. A generated tone is used when unset.
    #[serde(default)]
    pub clip: Option<String>,

    #[serde(default)]
    pub stream_type: StreamType,

    #[serde(default = "default_guild_id")]
    pub guild_id: String,

    #[serde(default = "default_channel_id")]
    pub channel_id: String,

    /// Loopback signaling delay before the link is ready.
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_guild_id() -> String {
    "smoke-guild".to_string()
}

fn default_channel_id() -> String {
    "smoke-channel".to_string()
}

fn default_ready_delay_ms() -> u64 {
    50
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            clip: None,
            stream_type: StreamType::default(),
            guild_id: default_guild_id(),
            channel_id: default_channel_id(),
            ready_delay_ms: default_ready_delay_ms(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The settings were read but cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] parley_voice::VoiceError),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLEY_FFMPEG` overrides `voice.ffmpeg_binary`
/// - `PARLEY_TTS_ENGINE` overrides `voice.tts.engine` ("google" or "espeak")
/// - `PARLEY_TTS_LANGUAGE` overrides `voice.tts.language`
/// - `PARLEY_READY_TIMEOUT_MS` overrides `voice.ready_timeout_ms`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting voice settings are invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.voice.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(level) = var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(ffmpeg) = var("PARLEY_FFMPEG") {
        config.voice.ffmpeg_binary = ffmpeg.into();
    }
    if let Some(engine) = var("PARLEY_TTS_ENGINE") {
        match engine.to_ascii_lowercase().as_str() {
            "google" => config.voice.tts.engine = TtsEngineKind::Google,
            "espeak" => config.voice.tts.engine = TtsEngineKind::Espeak,
            other => tracing::warn!(value = other, "ignoring unknown PARLEY_TTS_ENGINE"),
        }
    }
    if let Some(language) = var("PARLEY_TTS_LANGUAGE") {
        config.voice.tts.language = language;
    }
    if let Some(timeout) = var("PARLEY_READY_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.voice.ready_timeout_ms = parsed;
        }
    }
}
