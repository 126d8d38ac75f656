//! Player, connection and stream type definitions.
//!
//! A `PlayerStatus` follows `Idle → Buffering → Playing → Idle`, with `Paused`
//! and `AutoPaused` as side states. Every transition back into `Idle` carries a
//! `PlaybackEnd` so callers can tell a finished clip from a failed one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Observable status of an audio player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// No resource is assigned.
    #[default]
    Idle,
    /// A resource is assigned but has not produced its first frame yet.
    Buffering,
    /// Frames are being dispatched to subscribers.
    Playing,
    /// Paused by an explicit `pause()` call.
    Paused,
    /// Paused because no subscriber was ready to receive audio.
    AutoPaused,
}

impl PlayerStatus {
    /// Returns the string label for this status.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::AutoPaused => "autopaused",
        }
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a player went back to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum PlaybackEnd {
    /// The resource ran out of frames.
    Finished,
    /// `stop()` was called.
    Stopped,
    /// The resource stalled for longer than the missed-frame tolerance.
    Underrun,
    /// No subscriber was attached and the behavior policy is `Stop`.
    NoSubscribers,
    /// The resource failed while producing frames.
    Errored(String),
}

impl PlaybackEnd {
    /// Returns `true` if the resource played to its natural end.
    pub fn is_natural(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// What a player does when none of its subscribers can receive audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoSubscriberBehavior {
    /// Hold the resource in place until a subscriber becomes ready.
    #[default]
    Pause,
    /// Keep consuming the resource as if someone were listening.
    Play,
    /// End playback.
    Stop,
}

/// Declared encoding of a playable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Any container/codec; decoded to PCM by ffmpeg.
    #[default]
    Arbitrary,
    /// Signed 16-bit little-endian PCM, 48 kHz, stereo.
    Raw,
    /// An Ogg Opus file or stream; demuxed without re-encoding.
    OggOpus,
    /// Pre-framed opus packets, one per stream item.
    Opus,
}

impl StreamType {
    /// Returns `true` if frames of this type reach the transport already encoded.
    pub fn is_opus(self) -> bool {
        matches!(self, Self::OggOpus | Self::Opus)
    }
}

/// Lifecycle of a voice connection as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Exchanging state with the signaling gateway.
    #[default]
    Signalling,
    /// Establishing the media session.
    Connecting,
    /// Able to send and receive audio.
    Ready,
    /// The media session dropped; the transport may recover.
    Disconnected,
    /// Torn down. Terminal.
    Destroyed,
}

impl ConnectionStatus {
    /// Returns `true` for states from which a connection can still become ready.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Signalling | Self::Connecting)
    }
}
