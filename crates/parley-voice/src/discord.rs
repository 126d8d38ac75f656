//! Discord voice transport backed by songbird.
//!
//! [`SongbirdAdapter`] joins channels through a shared [`Songbird`] manager.
//! Songbird owns the gateway handshake, RTP and encryption, and it also decodes,
//! mixes and paces audio: players subscribed to a [`SongbirdLink`] hand their
//! resources to it as tracks. Volume changes go to `TrackHandle::set_volume`
//! and the track's end or error event ends the player's run.
//!
//! Incoming audio is read from `VoiceTick` events. The manager must run with
//! [`SongbirdAdapter::receive_config`] (opus payloads decrypted but not
//! decoded) for `VoiceTick` to carry packets.

use crate::config::RecordingConfig;
use crate::decode::{open_reader, read_full, PCM_FRAME_BYTES};
use crate::error::VoiceError;
use crate::lock;
use crate::ogg_writer::OggOpusWriter;
use crate::player::{PlaybackRun, TrackEngine};
use crate::resource::{AudioResource, AudioSource};
use crate::transport::{advance, AudioFrame, PacketSource, UserFeeds, VoiceAdapter, VoiceLink};
use ::songbird::driver::DecodeMode;
use ::songbird::input::{
    AsyncAdapterStream, AsyncMediaSource, AudioStream, AudioStreamError, File as FileInput,
    HttpRequest, Input, LiveInput, RawAdapter,
};
use ::songbird::tracks::{PlayMode, TrackHandle};
use ::songbird::{Call, CoreEvent, Event, EventContext, EventHandler, Songbird, TrackEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use parley_types::{
    ChannelId, ConnectionStatus, GuildId, PlaybackEnd, PlayerStatus, StreamType, UserId, CHANNELS,
    SAMPLE_RATE,
};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::num::NonZeroU64;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use symphonia::core::io::MediaSource;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bytes buffered between a live source and songbird's decoder.
const LIVE_BUFFER_BYTES: usize = 64 * 1024;

/// Joins Discord voice channels through songbird.
#[derive(Clone)]
pub struct SongbirdAdapter {
    manager: Arc<Songbird>,
    http: reqwest::Client,
}

impl SongbirdAdapter {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
        }
    }

    /// Driver settings that make `VoiceTick` carry opus payloads.
    pub fn receive_config() -> ::songbird::Config {
        ::songbird::Config::default().decode_mode(DecodeMode::Decrypt)
    }
}

impl std::fmt::Debug for SongbirdAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongbirdAdapter").finish_non_exhaustive()
    }
}

fn snowflake(raw: &str, kind: &str) -> Result<NonZeroU64, VoiceError> {
    raw.parse()
        .map_err(|_| VoiceError::Source(format!("invalid discord {kind} id: {raw}")))
}

#[async_trait]
impl VoiceAdapter for SongbirdAdapter {
    async fn open(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Arc<dyn VoiceLink>, VoiceError> {
        let guild = snowflake(guild_id.as_str(), "guild")?;
        let channel = snowflake(channel_id.as_str(), "channel")?;

        let link = Arc::new(SongbirdLink::new(
            self.manager.clone(),
            self.http.clone(),
            guild_id.clone(),
            guild,
        ));
        let joining = link.clone();
        tokio::spawn(async move { joining.join(channel).await });
        Ok(link)
    }
}

/// One guild's songbird call.
pub struct SongbirdLink {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    guild_id: GuildId,
    discord_guild: NonZeroU64,
    status: Arc<watch::Sender<ConnectionStatus>>,
    call: OnceLock<Arc<tokio::sync::Mutex<Call>>>,
    feeds: Arc<UserFeeds>,
    closed: AtomicBool,
    frames_ignored: AtomicBool,
}

impl SongbirdLink {
    fn new(
        manager: Arc<Songbird>,
        http: reqwest::Client,
        guild_id: GuildId,
        discord_guild: NonZeroU64,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Signalling);
        Self {
            manager,
            http,
            guild_id,
            discord_guild,
            status: Arc::new(status),
            call: OnceLock::new(),
            feeds: Arc::default(),
            closed: AtomicBool::new(false),
            frames_ignored: AtomicBool::new(false),
        }
    }

    async fn join(self: Arc<Self>, channel: NonZeroU64) {
        self.status
            .send_if_modified(|s| advance(s, ConnectionStatus::Connecting));

        let call = match self.manager.join(self.discord_guild, channel).await {
            Ok(call) => call,
            Err(e) => {
                warn!(guild_id = %self.guild_id, channel_id = channel.get(), error = %e, "songbird join failed");
                self.status
                    .send_if_modified(|s| advance(s, ConnectionStatus::Disconnected));
                return;
            }
        };

        if self.closed.load(Ordering::SeqCst) {
            // Destroyed (e.g. timed out) while the join was in flight.
            if let Err(e) = self.manager.remove(self.discord_guild).await {
                debug!(guild_id = %self.guild_id, error = %e, "late leave failed");
            }
            return;
        }

        {
            let mut handler = call.lock().await;
            let events = LinkEvents {
                guild_id: self.guild_id.clone(),
                status: self.status.clone(),
                feeds: self.feeds.clone(),
                speakers: Arc::default(),
            };
            for event in [
                CoreEvent::DriverConnect,
                CoreEvent::DriverReconnect,
                CoreEvent::DriverDisconnect,
                CoreEvent::SpeakingStateUpdate,
                CoreEvent::ClientDisconnect,
                CoreEvent::VoiceTick,
            ] {
                handler.add_global_event(Event::Core(event), events.clone());
            }
        }
        let _ = self.call.set(call);

        info!(guild_id = %self.guild_id, channel_id = channel.get(), "joined voice channel through songbird");
        self.status
            .send_if_modified(|s| advance(s, ConnectionStatus::Ready));
    }
}

impl VoiceLink for SongbirdLink {
    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn send_frame(&self, _frame: &AudioFrame) {
        // Songbird plays whole tracks. Frames only arrive from players that
        // started before they were subscribed here.
        if !self.frames_ignored.swap(true, Ordering::Relaxed) {
            debug!(guild_id = %self.guild_id, "songbird link ignores ticked frames; subscribe before playing");
        }
    }

    fn packets(&self) -> Arc<dyn PacketSource> {
        self.feeds.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.send_replace(ConnectionStatus::Destroyed);
        self.feeds.close();

        let manager = self.manager.clone();
        let guild = self.discord_guild;
        let guild_id = self.guild_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = manager.remove(guild).await {
                        debug!(guild_id = %guild_id, error = %e, "songbird leave failed");
                    }
                });
            }
            Err(_) => warn!(guild_id = %self.guild_id, "no runtime to leave the songbird call"),
        }
    }

    fn track_engine(&self) -> Option<Arc<dyn TrackEngine>> {
        let call = self.call.get()?.clone();
        Some(Arc::new(SongbirdEngine {
            call,
            http: self.http.clone(),
        }))
    }
}

impl std::fmt::Debug for SongbirdLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongbirdLink")
            .field("guild_id", &self.guild_id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Driver and receive events of one call.
#[derive(Clone)]
struct LinkEvents {
    guild_id: GuildId,
    status: Arc<watch::Sender<ConnectionStatus>>,
    feeds: Arc<UserFeeds>,
    /// SSRC to speaking user, learned from speaking-state updates.
    speakers: Arc<Mutex<HashMap<u32, UserId>>>,
}

impl LinkEvents {
    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == ConnectionStatus::Destroyed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[async_trait]
impl EventHandler for LinkEvents {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                self.set_status(ConnectionStatus::Ready);
            }
            EventContext::DriverDisconnect(_) => {
                warn!(guild_id = %self.guild_id, "songbird driver disconnected");
                self.set_status(ConnectionStatus::Disconnected);
            }
            EventContext::SpeakingStateUpdate(speaking) => {
                if let Some(user) = speaking.user_id {
                    lock(&self.speakers).insert(speaking.ssrc, UserId::from(user.0));
                }
            }
            EventContext::ClientDisconnect(disconnect) => {
                let user = UserId::from(disconnect.user_id.0);
                lock(&self.speakers).retain(|_, speaker| *speaker != user);
                self.feeds.remove_user(&user);
            }
            EventContext::VoiceTick(tick) => {
                let speakers = lock(&self.speakers);
                for (ssrc, data) in &tick.speaking {
                    let (Some(user), Some(rtp)) = (speakers.get(ssrc), data.packet.as_ref()) else {
                        continue;
                    };
                    let end = rtp.packet.len().saturating_sub(rtp.payload_end_pad);
                    if rtp.payload_offset < end {
                        self.feeds
                            .push(user, rtp.packet.slice(rtp.payload_offset..end));
                    }
                }
            }
            _ => {}
        }
        None
    }
}

/// Plays resources as tracks on a songbird call.
struct SongbirdEngine {
    call: Arc<tokio::sync::Mutex<Call>>,
    http: reqwest::Client,
}

enum TrackNotice {
    Playable,
    Ended,
    Failed(String),
}

struct TrackNotifier {
    tx: mpsc::UnboundedSender<TrackNotice>,
}

#[async_trait]
impl EventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _) in tracks.iter() {
                let notice = match &state.playing {
                    PlayMode::Errored(e) => TrackNotice::Failed(format!("{e:?}")),
                    PlayMode::End | PlayMode::Stop => TrackNotice::Ended,
                    _ => TrackNotice::Playable,
                };
                let _ = self.tx.send(notice);
            }
        }
        None
    }
}

#[async_trait]
impl TrackEngine for SongbirdEngine {
    async fn play(&self, resource: AudioResource, mut run: PlaybackRun) {
        let (handle, source) = resource.into_parts();
        let (input, pump) = match track_input(source, handle.stream_type(), &self.http) {
            Ok(prepared) => prepared,
            Err(e) => {
                run.finish(PlaybackEnd::Errored(e.to_string()));
                return;
            }
        };

        let track = self.call.lock().await.play_input(input);
        let mut volume = handle.volume_control().map(|control| control.subscribe());
        if let Some(volume) = &volume {
            let _ = track.set_volume(*volume.borrow());
        }

        let (tx, mut notices) = mpsc::unbounded_channel();
        for event in [TrackEvent::Playable, TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = track.add_event(Event::Track(event), TrackNotifier { tx: tx.clone() }) {
                stop_track(&track, pump);
                run.finish(PlaybackEnd::Errored(e.to_string()));
                return;
            }
        }
        drop(tx);

        debug!(player_id = run.player_id(), track = %track.uuid(), "songbird track started");
        let cancel = run.cancellation();
        let end = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    stop_track(&track, pump);
                    return;
                }
                notice = notices.recv() => match notice {
                    Some(TrackNotice::Playable) => run.started(),
                    Some(TrackNotice::Failed(reason)) => break PlaybackEnd::Errored(reason),
                    Some(TrackNotice::Ended) | None => break source_outcome(pump).await,
                },
                control = run.next_control() => match control {
                    Some(PlayerStatus::Paused) => {
                        let _ = track.pause();
                    }
                    Some(PlayerStatus::Playing) => {
                        let _ = track.play();
                    }
                    Some(_) => {}
                    None => {
                        stop_track(&track, pump);
                        return;
                    }
                },
                changed = next_volume(&mut volume) => match changed {
                    Some(level) => {
                        let _ = track.set_volume(level);
                    }
                    None => volume = None,
                },
            }
        };
        run.finish(end);
    }
}

fn stop_track(track: &TrackHandle, pump: Option<JoinHandle<Result<(), VoiceError>>>) {
    let _ = track.stop();
    if let Some(pump) = pump {
        pump.abort();
    }
}

/// A track that reached its end finished cleanly unless the live source
/// feeding it failed.
async fn source_outcome(pump: Option<JoinHandle<Result<(), VoiceError>>>) -> PlaybackEnd {
    let Some(pump) = pump else {
        return PlaybackEnd::Finished;
    };
    match tokio::time::timeout(Duration::from_secs(1), pump).await {
        Ok(Ok(Err(e))) => PlaybackEnd::Errored(e.to_string()),
        _ => PlaybackEnd::Finished,
    }
}

async fn next_volume(volume: &mut Option<watch::Receiver<f32>>) -> Option<f32> {
    match volume {
        Some(rx) => {
            rx.changed().await.ok()?;
            let level = *rx.borrow();
            Some(level)
        }
        None => std::future::pending().await,
    }
}

/// Builds the songbird input for `source`. Files and URLs are opened by
/// songbird itself; everything else is pumped through an in-memory pipe.
fn track_input(
    source: AudioSource,
    stream_type: StreamType,
    http: &reqwest::Client,
) -> Result<(Input, Option<JoinHandle<Result<(), VoiceError>>>), VoiceError> {
    let container = !matches!(stream_type, StreamType::Raw | StreamType::Opus);
    let source = match source {
        AudioSource::File(path) if container => return Ok((FileInput::new(path).into(), None)),
        AudioSource::Url(url) if container => {
            return Ok((HttpRequest::new(http.clone(), url).into(), None))
        }
        AudioSource::Stream(_) if stream_type == StreamType::Opus => source,
        _ if stream_type == StreamType::Opus => {
            return Err(VoiceError::Source(
                "opus input must be a stream of packets".to_string(),
            ))
        }
        source => source,
    };

    let (reader, writer) = tokio::io::duplex(LIVE_BUFFER_BYTES);
    let pumping = tokio::spawn(pump(source, stream_type, writer));
    let stream = AsyncAdapterStream::new(Box::new(PipeSource(reader)), LIVE_BUFFER_BYTES);
    let input = if stream_type == StreamType::Raw {
        RawAdapter::new(stream, SAMPLE_RATE, u32::from(CHANNELS)).into()
    } else {
        Input::Live(
            LiveInput::Raw(AudioStream {
                input: Box::new(stream) as Box<dyn MediaSource>,
                hint: None,
            }),
            None,
        )
    };
    Ok((input, Some(pumping)))
}

/// Writes `source` into `out` in a form songbird can decode: opus packets are
/// wrapped in Ogg, raw s16le PCM becomes f32le, anything else is copied.
async fn pump(
    source: AudioSource,
    stream_type: StreamType,
    mut out: DuplexStream,
) -> Result<(), VoiceError> {
    match stream_type {
        StreamType::Opus => {
            let AudioSource::Stream(mut packets) = source else {
                return Err(VoiceError::Source(
                    "opus input must be a stream of packets".to_string(),
                ));
            };
            // One page per packet keeps latency at a single frame.
            let config = RecordingConfig {
                max_packets_per_page: 1,
                ..RecordingConfig::default()
            };
            let mut ogg = OggOpusWriter::new(Vec::new(), &config)?;
            while let Some(packet) = packets.next().await {
                let packet = packet?;
                ogg.write_packet(&packet)?;
                let pages = std::mem::take(ogg.get_mut());
                out.write_all(&pages).await?;
            }
            let rest = ogg.finish()?;
            out.write_all(&rest).await?;
        }
        StreamType::Raw => {
            let mut reader = open_reader(source).await?;
            let mut buf = vec![0u8; PCM_FRAME_BYTES];
            loop {
                let filled = read_full(&mut reader, &mut buf).await?;
                if filled == 0 {
                    break;
                }
                out.write_all(&pcm_to_f32le(&buf[..filled])).await?;
                if filled < buf.len() {
                    break;
                }
            }
        }
        StreamType::OggOpus | StreamType::Arbitrary => {
            let mut reader = open_reader(source).await?;
            tokio::io::copy(&mut reader, &mut out).await?;
        }
    }
    out.shutdown().await?;
    Ok(())
}

/// s16le samples to the f32le layout `RawAdapter` expects. A trailing odd
/// byte is dropped.
fn pcm_to_f32le(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .flat_map(|pair| {
            let sample = f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0;
            sample.to_le_bytes()
        })
        .collect()
}

/// Read half of the pump's pipe. Live sources cannot seek.
struct PipeSource(DuplexStream);

impl AsyncRead for PipeSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncSeek for PipeSource {
    fn start_seek(self: Pin<&mut Self>, _position: SeekFrom) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "live audio cannot seek",
        ))
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(0))
    }
}

#[async_trait]
impl AsyncMediaSource for PipeSource {
    fn is_seekable(&self) -> bool {
        false
    }

    async fn byte_len(&self) -> Option<u64> {
        None
    }

    async fn try_resume(
        &mut self,
        _offset: u64,
    ) -> Result<Box<dyn AsyncMediaSource>, AudioStreamError> {
        Err(AudioStreamError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use tokio::io::AsyncReadExt;

    #[test]
    fn snowflakes_must_be_numeric() {
        assert_eq!(snowflake("80351110224678912", "guild").unwrap().get(), 80351110224678912);
        assert!(matches!(snowflake("g1", "guild"), Err(VoiceError::Source(_))));
        assert!(snowflake("0", "channel").is_err());
    }

    #[test]
    fn pcm_is_rescaled_to_unit_floats() {
        let pcm: Vec<u8> = [i16::MIN, 0, 16_384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .chain([0x7f])
            .collect();
        let floats: Vec<f32> = pcm_to_f32le(&pcm)
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats, vec![-1.0, 0.0, 0.5]);
    }

    #[tokio::test]
    async fn opus_packets_are_pumped_as_ogg() {
        let packets = stream::iter(vec![
            Ok(Bytes::from_static(&[0xf8, 0x01, 0x01])),
            Ok(Bytes::from_static(&[0xf8, 0x01, 0x02])),
        ]);
        let (mut reader, writer) = tokio::io::duplex(LIVE_BUFFER_BYTES);
        pump(AudioSource::stream(packets), StreamType::Opus, writer)
            .await
            .unwrap();

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        let mut pages = ogg::PacketReader::new(io::Cursor::new(bytes));
        let mut audio = Vec::new();
        while let Some(packet) = pages.read_packet().unwrap() {
            if !packet.data.starts_with(b"Opus") {
                audio.push(packet.data);
            }
        }
        assert_eq!(audio, vec![vec![0xf8, 0x01, 0x01], vec![0xf8, 0x01, 0x02]]);
    }

    #[test]
    fn opus_files_are_refused() {
        let err = track_input(
            AudioSource::parse("clip.opus"),
            StreamType::Opus,
            &reqwest::Client::new(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("stream of packets"));
    }
}
