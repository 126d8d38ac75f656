//! Text-to-speech playback into a guild's voice connection.

use crate::completion::Completion;
use crate::config::{TtsConfig, TtsEngineKind, VoiceConfig};
use crate::connection::{Connection, PlayerSubscription};
use crate::error::VoiceError;
use crate::player::{create_player, wait_for_idle, Player, StateChange};
use crate::registry::ConnectionRegistry;
use crate::resource::AudioSource;
use crate::starter::{start_playing, StartOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use parley_types::{GuildId, PlaybackEnd, StreamType};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Maximum text input size for TTS (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Longest text the Google endpoint accepts per request, in characters.
const GOOGLE_CHUNK_CHARS: usize = 200;

/// Timeout for TTS process execution.
const TTS_TIMEOUT: Duration = Duration::from_secs(60);

pub const NOT_IN_CHANNEL_REPLY: &str = "I'm not in the voice channel anymore!";

/// Called once with the terminal reason after speech finishes.
pub type TtsCallback = Box<dyn FnOnce(PlaybackEnd) + Send + 'static>;

/// Turns text into playable audio.
#[async_trait]
pub trait SpeechEngine: Send + Sync + 'static {
    async fn synthesize(&self, text: &str, language: &str) -> Result<AudioSource, VoiceError>;

    /// How the synthesized audio must be decoded.
    fn stream_type(&self) -> StreamType {
        StreamType::Arbitrary
    }
}

/// The message a TTS request came from.
#[async_trait]
pub trait MessageContext: Send + Sync {
    fn guild_id(&self) -> &GuildId;

    async fn reply(&self, content: &str) -> Result<(), VoiceError>;
}

fn check_input(text: &str) -> Result<(), VoiceError> {
    if text.trim().is_empty() {
        return Err(VoiceError::Tts("text is empty".to_string()));
    }
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Tts(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Google Translate's TTS endpoint. Long text is split into requests of at
/// most 200 characters whose MP3 bodies are played back to back.
#[derive(Debug, Clone)]
pub struct GoogleTts {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleTts {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Request URLs for `text`, one per chunk.
    pub fn request_urls(&self, text: &str, language: &str) -> Result<Vec<url::Url>, VoiceError> {
        let chunks = split_text(text, GOOGLE_CHUNK_CHARS);
        let total = chunks.len().to_string();
        chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| {
                url::Url::parse_with_params(
                    &self.endpoint,
                    &[
                        ("ie", "UTF-8"),
                        ("q", chunk.as_str()),
                        ("tl", language),
                        ("total", total.as_str()),
                        ("idx", idx.to_string().as_str()),
                        ("textlen", chunk.chars().count().to_string().as_str()),
                        ("client", "tw-ob"),
                    ],
                )
                .map_err(|e| VoiceError::Config(format!("invalid TTS endpoint: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl SpeechEngine for GoogleTts {
    async fn synthesize(&self, text: &str, language: &str) -> Result<AudioSource, VoiceError> {
        check_input(text)?;
        let urls = self.request_urls(text, language)?;
        debug!(chunks = urls.len(), language, "requesting google tts");

        let client = self.client.clone();
        let body = stream::iter(urls)
            .then(move |url| {
                let client = client.clone();
                async move {
                    let response = client
                        .get(url)
                        .send()
                        .await
                        .and_then(reqwest::Response::error_for_status)
                        .map_err(io::Error::other)?;
                    Ok::<_, io::Error>(
                        response
                            .bytes_stream()
                            .map(|chunk| chunk.map_err(io::Error::other)),
                    )
                }
            })
            .try_flatten();
        Ok(AudioSource::stream(body))
    }
}

/// Splits `text` on whitespace into pieces of at most `limit` characters.
/// Words longer than `limit` are cut.
fn split_text(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = word.split_off(limit);
            chunks.push(word.into_iter().collect());
            word = rest;
        }
        if word.is_empty() {
            continue;
        }
        let separator = usize::from(!current.is_empty());
        if current_len + separator + word.len() > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current_len += word.len();
        current.extend(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Local `espeak-ng`. Produces a WAV file in memory.
#[derive(Debug, Clone)]
pub struct EspeakTts {
    binary: PathBuf,
}

impl EspeakTts {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SpeechEngine for EspeakTts {
    async fn synthesize(&self, text: &str, language: &str) -> Result<AudioSource, VoiceError> {
        check_input(text)?;

        let mut command = Command::new(&self.binary);
        command
            .arg("-v")
            .arg(language)
            .arg("--stdout")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn {:?}: {}", self.binary, e)))?;

        let output = tokio::time::timeout(TTS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    TTS_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for espeak-ng: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("espeak-ng failed: {}", stderr)));
        }

        Ok(AudioSource::Bytes(Bytes::from(output.stdout)))
    }
}

/// Builds the engine selected by `config`.
pub fn engine_from_config(config: &TtsConfig) -> Arc<dyn SpeechEngine> {
    match config.engine {
        TtsEngineKind::Google => Arc::new(GoogleTts::new(config.endpoint.clone())),
        TtsEngineKind::Espeak => Arc::new(EspeakTts::new(&config.espeak_binary)),
    }
}

/// Speaks `text` into the voice connection of the message's guild.
///
/// A fresh player is subscribed to the connection for the duration of the
/// speech. The returned completion resolves with the terminal reason once the
/// player goes idle, after the player has been unsubscribed and stopped and
/// `callback` has run.
///
/// # Errors
///
/// Returns `VoiceError::NoActiveConnection` after replying to the message if
/// the guild has no connection. Synthesis failures are returned directly.
pub async fn tts(
    text: &str,
    ctx: &dyn MessageContext,
    registry: &ConnectionRegistry,
    engine: &dyn SpeechEngine,
    config: &VoiceConfig,
    callback: Option<TtsCallback>,
) -> Result<Completion<PlaybackEnd>, VoiceError> {
    let guild_id = ctx.guild_id().clone();
    let Some(connection) = registry.get(&guild_id) else {
        if let Err(e) = ctx.reply(NOT_IN_CHANNEL_REPLY).await {
            warn!(guild_id = %guild_id, error = %e, "failed to reply to tts request");
        }
        return Err(VoiceError::NoActiveConnection(guild_id));
    };

    let player = create_player(config.player_behaviors())?;
    let subscription = connection.subscribe(&player)?;
    let events = player.events();

    let source = match engine.synthesize(text, &config.tts.language).await {
        Ok(source) => source,
        Err(e) => {
            subscription.unsubscribe();
            error!(guild_id = %guild_id, error = %e, "speech synthesis failed");
            return Err(e);
        }
    };
    let options = StartOptions {
        stream_type: Some(engine.stream_type()),
        volume: None,
    };
    if let Err(e) = start_playing(source, &player, options, &config.ffmpeg_binary) {
        subscription.unsubscribe();
        return Err(e);
    }
    info!(guild_id = %guild_id, player_id = player.id(), chars = text.chars().count(), "speaking");

    Ok(Completion::spawn(observe(
        events,
        player,
        subscription,
        connection,
        callback,
    )))
}

async fn observe(
    mut events: broadcast::Receiver<StateChange>,
    player: Player,
    subscription: PlayerSubscription,
    connection: Connection,
    callback: Option<TtsCallback>,
) -> Result<PlaybackEnd, VoiceError> {
    let end = match wait_for_idle(&mut events).await {
        Ok(end) => end,
        Err(e) => return Err(observer_failure(e.to_string(), &connection)),
    };

    subscription.unsubscribe();
    player.stop();

    if let Some(callback) = callback {
        let reason = end.clone();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || callback(reason))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            return Err(observer_failure(
                format!("tts callback panicked: {}", message),
                &connection,
            ));
        }
    }
    debug!(guild_id = %connection.guild_id(), end = ?end, "speech finished");
    Ok(end)
}

/// Falls back to leaving the channel. The trigger and the fallback outcome
/// are logged separately.
fn observer_failure(trigger: String, connection: &Connection) -> VoiceError {
    error!(guild_id = %connection.guild_id(), trigger = %trigger, "tts observer failed");
    let cleanup = match connection.destroy() {
        Ok(()) => "connection destroyed".to_string(),
        Err(e) => e.to_string(),
    };
    error!(guild_id = %connection.guild_id(), cleanup = %cleanup, "tts observer fallback");
    VoiceError::Observer { trigger, cleanup }
}
