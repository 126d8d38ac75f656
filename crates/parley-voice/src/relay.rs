//! Relaying one participant's audio to another player.

use crate::error::VoiceError;
use crate::player::Player;
use crate::receiver::{EndBehavior, VoiceReceiver};
use crate::resource::{create_audio_resource, AudioSource, ResourceHandle, ResourceOptions};
use futures_util::StreamExt;
use parley_types::{StreamType, UserId};
use tracing::info;

/// Plays `user_id`'s live opus packets on `player` without re-encoding. Runs
/// until the user's feed closes or the player is stopped.
///
/// # Errors
///
/// Propagates subscription failures and `VoiceError::PlayerBusy`.
pub fn pipe_to_guild(
    receiver: &VoiceReceiver,
    user_id: &UserId,
    player: &Player,
) -> Result<ResourceHandle, VoiceError> {
    let packets = receiver.subscribe(user_id, EndBehavior::Manual)?;
    let resource = create_audio_resource(
        AudioSource::stream(packets.map(Ok)),
        ResourceOptions {
            stream_type: StreamType::Opus,
            ..ResourceOptions::default()
        },
    );
    let handle = player.play(resource)?;
    info!(
        source_guild = %receiver.guild_id(),
        user_id = %user_id,
        player_id = player.id(),
        "relaying user audio"
    );
    Ok(handle)
}
