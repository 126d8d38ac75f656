use parley_types::{ChannelId, GuildId};
use std::fmt;
use thiserror::Error;

/// Stage of the recording pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Subscribing to the participant's audio.
    Subscribe,
    /// Wrapping packets into the Ogg container.
    Container,
    /// Creating, writing or flushing the output file.
    Filesystem,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subscribe => "subscribe",
            Self::Container => "container",
            Self::Filesystem => "filesystem",
        })
    }
}

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("failed to connect to channel {channel_id} in guild {guild_id}: {reason}")]
    ConnectionFailed {
        guild_id: GuildId,
        channel_id: ChannelId,
        reason: String,
    },

    #[error("voice connection for guild {0} has been destroyed")]
    ConnectionDestroyed(GuildId),

    #[error("no active voice connection for guild {0}")]
    NoActiveConnection(GuildId),

    #[error("player already has an active resource")]
    PlayerBusy,

    #[error("recording pipeline failed at {stage} stage: {message}")]
    Pipeline {
        stage: PipelineStage,
        message: String,
    },

    #[error("state observer failed: {trigger} (cleanup: {cleanup})")]
    Observer { trigger: String, cleanup: String },

    #[error("audio source error: {0}")]
    Source(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("failed to send reply: {0}")]
    Reply(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VoiceError {
    pub(crate) fn pipeline(stage: PipelineStage, err: impl fmt::Display) -> Self {
        Self::Pipeline {
            stage,
            message: err.to_string(),
        }
    }

    /// Returns the failing stage for recording errors.
    pub fn pipeline_stage(&self) -> Option<PipelineStage> {
        match self {
            Self::Pipeline { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
