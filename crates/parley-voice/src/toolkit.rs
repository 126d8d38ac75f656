//! Facade bundling configuration, the connection registry and a speech engine.

use crate::completion::Completion;
use crate::config::VoiceConfig;
use crate::connection::Connection;
use crate::connector::connect_to_channel;
use crate::error::VoiceError;
use crate::player::{create_player, Player};
use crate::receiver::VoiceReceiver;
use crate::recorder::{record_to_file, RecordOptions};
use crate::registry::ConnectionRegistry;
use crate::relay::pipe_to_guild;
use crate::resource::{AudioSource, ResourceHandle};
use crate::session::{play, PlayOptions, PlaySession};
use crate::starter::{start_playing, StartOptions};
use crate::transport::VoiceChannel;
use crate::tts::{engine_from_config, tts, MessageContext, SpeechEngine, TtsCallback};
use parley_types::{GuildId, PlaybackEnd, UserId};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct VoiceToolkit {
    config: Arc<VoiceConfig>,
    registry: ConnectionRegistry,
    engine: Arc<dyn SpeechEngine>,
}

impl VoiceToolkit {
    /// Validates `config` and builds the speech engine it selects.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Config` for unusable settings.
    pub fn new(config: VoiceConfig) -> Result<Self, VoiceError> {
        config.validate()?;
        let engine = engine_from_config(&config.tts);
        Ok(Self::with_engine(config, engine))
    }

    pub fn with_engine(config: VoiceConfig, engine: Arc<dyn SpeechEngine>) -> Self {
        Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            engine,
        }
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection(&self, guild_id: &GuildId) -> Option<Connection> {
        self.registry.get(guild_id)
    }

    pub async fn connect(&self, channel: &VoiceChannel) -> Result<Connection, VoiceError> {
        connect_to_channel(channel, &self.registry, self.config.ready_timeout()).await
    }

    pub fn disconnect(&self, guild_id: &GuildId) -> Result<bool, VoiceError> {
        self.registry.disconnect(guild_id)
    }

    pub fn create_player(&self) -> Result<Player, VoiceError> {
        create_player(self.config.player_behaviors())
    }

    pub fn start_playing(
        &self,
        source: impl Into<AudioSource>,
        player: &Player,
        options: StartOptions,
    ) -> Result<ResourceHandle, VoiceError> {
        start_playing(source, player, options, &self.config.ffmpeg_binary)
    }

    pub async fn tts(
        &self,
        text: &str,
        ctx: &dyn MessageContext,
        callback: Option<TtsCallback>,
    ) -> Result<Completion<PlaybackEnd>, VoiceError> {
        tts(
            text,
            ctx,
            &self.registry,
            self.engine.as_ref(),
            &self.config,
            callback,
        )
        .await
    }

    pub fn pipe_to_guild(
        &self,
        receiver: &VoiceReceiver,
        user_id: &UserId,
        player: &Player,
    ) -> Result<ResourceHandle, VoiceError> {
        pipe_to_guild(receiver, user_id, player)
    }

    /// Records with the configured default silence timeout unless `options`
    /// overrides it.
    pub fn record_to_file(
        &self,
        receiver: &VoiceReceiver,
        user_id: &UserId,
        filename: impl AsRef<Path>,
        options: Option<RecordOptions>,
    ) -> Completion<PathBuf> {
        let options = options.unwrap_or(RecordOptions {
            silence_timeout: self.config.silence_timeout(),
        });
        record_to_file(receiver, user_id, filename, options, &self.config.recording)
    }

    pub async fn play(
        &self,
        source: impl Into<AudioSource>,
        channel: &VoiceChannel,
        options: PlayOptions,
    ) -> Result<PlaySession, VoiceError> {
        play(source, channel, options, &self.registry, &self.config).await
    }
}

impl std::fmt::Debug for VoiceToolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceToolkit")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
