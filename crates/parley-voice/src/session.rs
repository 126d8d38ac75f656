//! One-call playback into a voice channel.

use crate::completion::Completion;
use crate::config::VoiceConfig;
use crate::connection::Connection;
use crate::connector::connect_to_channel;
use crate::error::VoiceError;
use crate::player::{create_player, wait_for_idle, Player, StateChange};
use crate::registry::ConnectionRegistry;
use crate::resource::{AudioSource, ResourceHandle};
use crate::starter::{start_playing, StartOptions};
use crate::transport::VoiceChannel;
use parley_types::{PlaybackEnd, StreamType};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    pub stream_type: Option<StreamType>,
    pub volume: Option<f32>,
    /// Leave the channel once playback ends. Defaults to `true`.
    pub auto_disconnect: Option<bool>,
}

/// Handles to a running `play` call.
#[derive(Debug)]
pub struct PlaySession {
    pub connection: Connection,
    pub player: Player,
    pub resource: ResourceHandle,
    /// Player transitions, starting with `Idle -> Buffering`.
    pub events: broadcast::Receiver<StateChange>,
    /// Resolves with the terminal reason once playback ends and teardown has
    /// run.
    pub teardown: Completion<PlaybackEnd>,
}

/// Joins `channel`, subscribes a fresh player, plays `source` and, unless `auto_disconnect` is `false`,
/// stops the player and destroys the connection once playback ends.
///
/// # Errors
///
/// Returns `VoiceError::ConnectionFailed` if the join fails; nothing is
/// played in that case.
pub async fn play(
    source: impl Into<AudioSource>,
    channel: &VoiceChannel,
    options: PlayOptions,
    registry: &ConnectionRegistry,
    config: &VoiceConfig,
) -> Result<PlaySession, VoiceError> {
    let player = create_player(config.player_behaviors())?;
    let connection = connect_to_channel(channel, registry, config.ready_timeout()).await?;

    // Subscribe first so transports that play whole tracks get the resource.
    if let Err(e) = connection.subscribe(&player) {
        let _ = connection.destroy();
        return Err(e);
    }

    let events = player.events();
    let mut idle_events = player.events();
    let resource = match start_playing(
        source,
        &player,
        StartOptions {
            stream_type: options.stream_type,
            volume: options.volume,
        },
        &config.ffmpeg_binary,
    ) {
        Ok(resource) => resource,
        Err(e) => {
            let _ = connection.destroy();
            return Err(e);
        }
    };

    let auto_disconnect = options.auto_disconnect.unwrap_or(true);
    info!(
        guild_id = %connection.guild_id(),
        channel_id = %connection.channel_id(),
        player_id = player.id(),
        auto_disconnect,
        "playing into voice channel"
    );

    let teardown = {
        let player = player.clone();
        let connection = connection.clone();
        Completion::spawn(async move {
            let end = wait_for_idle(&mut idle_events).await?;
            if !auto_disconnect {
                debug!(guild_id = %connection.guild_id(), end = ?end, "playback ended, staying connected");
                return Ok(end);
            }
            player.stop();
            match connection.destroy() {
                Ok(()) => info!(guild_id = %connection.guild_id(), end = ?end, "playback ended, left channel"),
                Err(e) => debug!(guild_id = %connection.guild_id(), error = %e, "connection already gone"),
            }
            Ok(end)
        })
    };

    Ok(PlaySession {
        connection,
        player,
        resource,
        events,
        teardown,
    })
}
