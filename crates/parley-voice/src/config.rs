use crate::error::VoiceError;
use crate::player::PlayerBehaviors;
use parley_types::{NoSubscriberBehavior, CHANNELS, SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_frame_duration_ms() -> u64 {
    20
}

fn default_missed_frame_tolerance_ms() -> u64 {
    5_000
}

fn default_silence_timeout_ms() -> u64 {
    1_000
}

fn default_ffmpeg_binary() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_channel_count() -> u8 {
    CHANNELS
}

fn default_sample_rate() -> u32 {
    SAMPLE_RATE
}

fn default_max_packets_per_page() -> usize {
    10
}

fn default_tts_language() -> String {
    "en".to_string()
}

fn default_tts_endpoint() -> String {
    "https://translate.google.com/translate_tts".to_string()
}

fn default_espeak_binary() -> PathBuf {
    PathBuf::from("espeak-ng")
}

/// Settings shared by every voice helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// How long `connect_to_channel` waits for the connection to become ready.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Playback tick. Every tick dispatches one frame.
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,
    /// How long a playing resource may stall before the player gives up.
    #[serde(default = "default_missed_frame_tolerance_ms")]
    pub missed_frame_tolerance_ms: u64,
    /// Default silence that ends a recording.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Decoder used for `StreamType::Arbitrary` sources.
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: PathBuf,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub tts: TtsConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            frame_duration_ms: default_frame_duration_ms(),
            missed_frame_tolerance_ms: default_missed_frame_tolerance_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            ffmpeg_binary: default_ffmpeg_binary(),
            recording: RecordingConfig::default(),
            tts: TtsConfig::default(),
        }
    }
}

impl VoiceConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    /// Behaviors for players created by the player factory: keep playing when
    /// nobody listens, and tolerate `missed_frame_tolerance_ms` of stalls.
    pub fn player_behaviors(&self) -> PlayerBehaviors {
        let frame_ms = self.frame_duration_ms.max(1);
        let max_missed = (self.missed_frame_tolerance_ms as f64 / frame_ms as f64).round();
        PlayerBehaviors {
            no_subscriber: NoSubscriberBehavior::Play,
            max_missed_frames: max_missed as u32,
            frame_duration: Duration::from_millis(self.frame_duration_ms),
        }
    }

    /// Rejects settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.frame_duration_ms == 0 {
            return Err(VoiceError::Config(
                "frame_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.ready_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "ready_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.recording.validate()
    }
}

/// Ogg Opus container parameters for recordings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_channel_count")]
    pub channel_count: u8,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Packets per Ogg page before the page is flushed.
    #[serde(default = "default_max_packets_per_page")]
    pub max_packets_per_page: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            channel_count: default_channel_count(),
            sample_rate: default_sample_rate(),
            max_packets_per_page: default_max_packets_per_page(),
        }
    }
}

impl RecordingConfig {
    fn validate(&self) -> Result<(), VoiceError> {
        if self.channel_count == 0 || self.channel_count > 2 {
            return Err(VoiceError::Config(
                "recording.channel_count must be 1 or 2".to_string(),
            ));
        }
        // Ogg pages hold at most 255 lacing values.
        if self.max_packets_per_page == 0 || self.max_packets_per_page > 255 {
            return Err(VoiceError::Config(
                "recording.max_packets_per_page must be between 1 and 255".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which speech engine backs `tts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsEngineKind {
    /// Google Translate's public TTS endpoint (MP3 over HTTP).
    #[default]
    Google,
    /// Local `espeak-ng` process (WAV on stdout).
    Espeak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub engine: TtsEngineKind,
    #[serde(default = "default_tts_language")]
    pub language: String,
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_espeak_binary")]
    pub espeak_binary: PathBuf,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: TtsEngineKind::default(),
            language: default_tts_language(),
            endpoint: default_tts_endpoint(),
            espeak_binary: default_espeak_binary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_behaviors_tolerate_five_seconds() {
        let behaviors = VoiceConfig::default().player_behaviors();
        assert_eq!(behaviors.max_missed_frames, 250);
        assert_eq!(behaviors.no_subscriber, NoSubscriberBehavior::Play);
        assert_eq!(behaviors.frame_duration, Duration::from_millis(20));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: VoiceConfig = toml::from_str(
            r#"
missed_frame_tolerance_ms = 1000

[recording]
channel_count = 1

[tts]
engine = "espeak"
"#,
        )
        .unwrap();
        assert_eq!(config.player_behaviors().max_missed_frames, 50);
        assert_eq!(config.recording.channel_count, 1);
        assert_eq!(config.recording.max_packets_per_page, 10);
        assert_eq!(config.tts.engine, TtsEngineKind::Espeak);
        assert_eq!(config.tts.language, "en");
        assert_eq!(config.ready_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_frame_duration() {
        let config = VoiceConfig {
            frame_duration_ms: 0,
            ..VoiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn validate_rejects_oversized_pages() {
        let mut config = VoiceConfig::default();
        config.recording.max_packets_per_page = 300;
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
    }
}
