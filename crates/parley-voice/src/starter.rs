//! Starting playback of a source on a player.

use crate::error::VoiceError;
use crate::player::Player;
use crate::resource::{create_audio_resource, AudioSource, ResourceHandle, ResourceOptions};
use parley_types::StreamType;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Defaults to `StreamType::Arbitrary`.
    pub stream_type: Option<StreamType>,
    /// Linear gain. Defaults to 1.0.
    pub volume: Option<f32>,
}

/// Wraps `source` in a resource with inline volume and starts it on `player`.
///
/// Decoding problems do not fail this call; they end playback with
/// `PlaybackEnd::Errored`.
///
/// # Errors
///
/// Returns `VoiceError::PlayerBusy` if `player` is not idle.
pub fn start_playing(
    source: impl Into<AudioSource>,
    player: &Player,
    options: StartOptions,
    ffmpeg_binary: &Path,
) -> Result<ResourceHandle, VoiceError> {
    let stream_type = options.stream_type.unwrap_or_default();
    let resource = create_audio_resource(
        source.into(),
        ResourceOptions {
            stream_type,
            inline_volume: true,
            ffmpeg_binary: ffmpeg_binary.to_path_buf(),
        },
    );
    resource.set_volume(options.volume.unwrap_or(1.0));

    let handle = player.play(resource)?;
    debug!(
        player_id = player.id(),
        resource_id = handle.id(),
        stream_type = ?stream_type,
        volume = ?handle.volume(),
        "playback started"
    );
    Ok(handle)
}
