mod common;

use async_trait::async_trait;
use common::{fast_config, loopback_channel, raw_pcm};
use parley_types::{GuildId, PlaybackEnd, StreamType};
use parley_voice::{
    connect_to_channel, tts, AudioSource, ConnectionRegistry, MessageContext, SpeechEngine,
    VoiceError, VoiceToolkit, NOT_IN_CHANNEL_REPLY,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

struct TestMessage {
    guild_id: GuildId,
    replies: Mutex<Vec<String>>,
}

impl TestMessage {
    fn new(guild: &str) -> Self {
        Self {
            guild_id: GuildId::from(guild),
            replies: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageContext for TestMessage {
    fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    async fn reply(&self, content: &str) -> Result<(), VoiceError> {
        self.replies.lock().unwrap().push(content.to_string());
        Ok(())
    }
}

/// Speaks every request as `frames` frames of raw PCM.
struct ScriptedEngine {
    frames: usize,
    calls: AtomicUsize,
    fail: bool,
}

impl ScriptedEngine {
    fn new(frames: usize) -> Self {
        Self {
            frames,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }
}

#[async_trait]
impl SpeechEngine for ScriptedEngine {
    async fn synthesize(&self, _text: &str, language: &str) -> Result<AudioSource, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(language, "en");
        if self.fail {
            return Err(VoiceError::Tts("engine offline".to_string()));
        }
        Ok(AudioSource::Bytes(raw_pcm(self.frames, 42)))
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Raw
    }
}

#[tokio::test]
async fn test_tts_without_connection_replies_once() {
    let registry = ConnectionRegistry::new();
    let engine = ScriptedEngine::new(1);
    let message = TestMessage::new("g1");

    let result = tts("hello", &message, &registry, &engine, &fast_config(), None).await;

    match result {
        Err(VoiceError::NoActiveConnection(guild)) => assert_eq!(guild.as_str(), "g1"),
        Err(other) => panic!("Expected NoActiveConnection, got {:?}", other),
        Ok(_) => panic!("Expected NoActiveConnection, got a completion"),
    }
    assert_eq!(*message.replies.lock().unwrap(), vec![NOT_IN_CHANNEL_REPLY]);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tts_plays_and_cleans_up() {
    let (channel, adapter) = loopback_channel("g1", "c1");
    let registry = ConnectionRegistry::new();
    let connection = connect_to_channel(&channel, &registry, Duration::from_secs(1))
        .await
        .unwrap();
    let engine = ScriptedEngine::new(4);
    let message = TestMessage::new("g1");
    let (done_tx, done_rx) = oneshot::channel();

    let completion = tts(
        "hello there",
        &message,
        &registry,
        &engine,
        &fast_config(),
        Some(Box::new(move |end: PlaybackEnd| {
            let _ = done_tx.send(end);
        })),
    )
    .await
    .expect("tts should start");

    assert_eq!(completion.await.unwrap(), PlaybackEnd::Finished);
    assert_eq!(done_rx.await.unwrap(), PlaybackEnd::Finished);
    assert!(message.replies.lock().unwrap().is_empty());
    assert!(!connection.is_destroyed());
    assert_eq!(adapter.last_link().unwrap().audio_frame_count(), 4);
}

#[tokio::test]
async fn test_tts_engine_failure_keeps_connection() {
    let (channel, _adapter) = loopback_channel("g1", "c1");
    let registry = ConnectionRegistry::new();
    let connection = connect_to_channel(&channel, &registry, Duration::from_secs(1))
        .await
        .unwrap();
    let engine = ScriptedEngine {
        fail: true,
        ..ScriptedEngine::new(1)
    };
    let message = TestMessage::new("g1");

    let result = tts("hello", &message, &registry, &engine, &fast_config(), None).await;
    assert!(matches!(result, Err(VoiceError::Tts(_))));
    assert!(!connection.is_destroyed());
}

#[tokio::test]
async fn test_tts_callback_panic_destroys_connection() {
    let (channel, _adapter) = loopback_channel("g1", "c1");
    let registry = ConnectionRegistry::new();
    let connection = connect_to_channel(&channel, &registry, Duration::from_secs(1))
        .await
        .unwrap();
    let engine = ScriptedEngine::new(1);
    let message = TestMessage::new("g1");

    let completion = tts(
        "hello",
        &message,
        &registry,
        &engine,
        &fast_config(),
        Some(Box::new(|_: PlaybackEnd| panic!("callback exploded"))),
    )
    .await
    .unwrap();

    match completion.await {
        Err(VoiceError::Observer { trigger, cleanup }) => {
            assert!(trigger.contains("callback exploded"));
            assert_eq!(cleanup, "connection destroyed");
        }
        other => panic!("Expected Observer error, got {:?}", other),
    }
    assert!(connection.is_destroyed());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_toolkit_tts_uses_registry() {
    let toolkit = VoiceToolkit::with_engine(fast_config(), Arc::new(ScriptedEngine::new(2)));
    let message = TestMessage::new("g1");

    let result = toolkit.tts("hello", &message, None).await;
    assert!(matches!(result, Err(VoiceError::NoActiveConnection(_))));

    let (channel, _adapter) = loopback_channel("g1", "c1");
    toolkit.connect(&channel).await.unwrap();
    let completion = toolkit.tts("hello", &message, None).await.unwrap();
    assert_eq!(completion.await.unwrap(), PlaybackEnd::Finished);
    assert_eq!(message.replies.lock().unwrap().len(), 1);
}
