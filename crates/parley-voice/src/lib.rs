//! Voice helpers for chat bots.
//!
//! Joins voice channels, plays audio from files, URLs, in-memory bytes and
//! live streams, speaks text through a TTS engine, relays one participant's
//! audio into another guild and records a participant to an Ogg Opus file.
//!
//! The voice transport (signaling, RTP, encryption) stays behind the
//! [`transport::VoiceAdapter`] trait. With the `songbird` feature, `discord`
//! joins real Discord channels and plays resources as songbird tracks;
//! [`loopback`] is an in-memory implementation used by tests and the host's
//! smoke run.

pub mod completion;
pub mod config;
pub mod connection;
pub mod connector;
mod decode;
#[cfg(feature = "songbird")]
pub mod discord;
pub mod error;
pub mod loopback;
pub mod ogg_writer;
pub mod player;
pub mod receiver;
pub mod recorder;
pub mod registry;
pub mod relay;
pub mod resource;
pub mod session;
pub mod starter;
pub mod toolkit;
pub mod transport;
pub mod tts;

pub use completion::Completion;
pub use config::{RecordingConfig, TtsConfig, TtsEngineKind, VoiceConfig};
pub use connection::{Connection, PlayerSubscription};
pub use connector::connect_to_channel;
#[cfg(feature = "songbird")]
pub use discord::{SongbirdAdapter, SongbirdLink};
pub use error::{PipelineStage, VoiceError};
pub use loopback::{LoopbackAdapter, LoopbackLink};
pub use ogg_writer::OggOpusWriter;
pub use player::{
    create_player, wait_for_idle, PlaybackRun, Player, PlayerBehaviors, StateChange, TrackEngine,
};
pub use receiver::{is_silence_frame, EndBehavior, OpusStream, VoiceReceiver, SILENCE_FRAME};
pub use recorder::{record_to_file, RecordOptions};
pub use registry::{get_voice_connection, ConnectionRegistry};
pub use relay::pipe_to_guild;
pub use resource::{
    create_audio_resource, AudioResource, AudioSource, ResourceHandle, ResourceOptions,
    VolumeControl,
};
pub use session::{play, PlayOptions, PlaySession};
pub use starter::{start_playing, StartOptions};
pub use toolkit::VoiceToolkit;
pub use transport::{AudioFrame, PacketSource, VoiceAdapter, VoiceChannel, VoiceLink};
pub use tts::{
    engine_from_config, tts, EspeakTts, GoogleTts, MessageContext, SpeechEngine, TtsCallback,
    NOT_IN_CHANNEL_REPLY,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked. All
/// guarded state here stays consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
